//! Row-scoped expressions and their lowering into the SSA IR.
//!
//! This is the engine-side representation the (out-of-scope) SQL front-end
//! produces. Lowering decides the numeric path: comparisons against integer
//! literals run the integer lanes, everything else goes through floats.
//! Validity masks thread through automatically; a lane drops out of a
//! predicate as soon as any operand is missing or of the wrong type.

use vex_types::Composer;

use crate::agg::AggKind;
use crate::consts::AGG_SLOT_SIZE;
use crate::error::{CompileError, VmResult};
use crate::ssa::{
    ArithOp, Builder, CaseMode, CmpOp, MathOp, OpKind, Prog, StrTestKind, Type, ValueId,
};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UnOp {
    Neg,
    Not,
    Abs,
    Sqrt,
    Floor,
    Ceil,
    Round,
    Ln,
    Log10,
    Exp,
}

/// A row-scoped expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted field access from the row root.
    Path(Vec<String>),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// Timestamp literal (epoch microseconds).
    Ts(i64),
    /// Null literal.
    Null,
    /// Binary operation.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// Unary operation.
    Un(UnOp, Box<Expr>),
    /// Wildcard pattern match.
    Like {
        /// Matched expression.
        expr: Box<Expr>,
        /// Pattern with `%` and `_`.
        pattern: String,
        /// ASCII case-insensitive.
        ci: bool,
    },
    /// `expr IS NULL` (true for both nulls and missing fields).
    IsNull(Box<Expr>),
    /// `expr IS NOT NULL`.
    IsNotNull(Box<Expr>),
    /// Membership in a literal list.
    In(Box<Expr>, Vec<Expr>),
    /// Whitespace trim.
    Trim(Box<Expr>),
    /// `SUBSTRING(expr, start, len)` with 1-based start.
    Substr(Box<Expr>, Box<Expr>, Box<Expr>),
    /// String concatenation.
    Concat(Box<Expr>, Box<Expr>),
    /// Byte length of a string.
    StrLen(Box<Expr>),
}

impl Expr {
    /// Field access from a dotted path like `"a.b.c"`.
    pub fn path(dotted: &str) -> Self {
        Self::Path(dotted.split('.').map(str::to_owned).collect())
    }

    /// Shorthand binary constructor.
    pub fn bin(op: BinOp, a: Expr, b: Expr) -> Self {
        Self::Bin(op, Box::new(a), Box::new(b))
    }

    fn is_str_literal(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    fn int_capable(&self) -> bool {
        match self {
            Self::Path(_) | Self::Int(_) | Self::Ts(_) => true,
            Self::Un(UnOp::Neg | UnOp::Abs, e) => e.int_capable(),
            Self::Bin(BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod, a, b) => {
                a.int_capable() && b.int_capable()
            }
            Self::StrLen(_) => true,
            _ => false,
        }
    }

    fn has_int_literal(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    fn has_ts_literal(&self) -> bool {
        matches!(self, Self::Ts(_))
    }
}

/// Numeric lowering flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumMode {
    Float,
    Int,
    Ts,
}

/// Lowering context: the builder plus the entry registers.
pub struct ExprCtx<'b> {
    b: &'b mut Builder,
    base: ValueId,
    entry: ValueId,
}

impl<'b> ExprCtx<'b> {
    /// Open a context over a builder with fresh entry registers.
    pub fn new(b: &'b mut Builder) -> Self {
        let entry = b.row_mask();
        let base = b.row_base();
        Self { b, base, entry }
    }

    /// The entry live-lane mask.
    pub fn entry(&self) -> ValueId {
        self.entry
    }

    /// The underlying builder, for callers composing raw mask ops.
    pub fn b_mut(&mut self) -> &mut Builder {
        self.b
    }

    /// Push a mask-producing op.
    pub fn push_mask(&mut self, kind: OpKind, args: Vec<ValueId>) -> ValueId {
        self.b.push(kind, args, Type::Mask)
    }

    /// Integer lanes of an expression: `(scalar, validity mask)`.
    pub fn num_int(&mut self, e: &Expr) -> VmResult<(ValueId, ValueId)> {
        let (v, m, _) = self.num(e, NumMode::Int)?;
        Ok((v, m))
    }

    /// Float lanes of an expression.
    pub fn num_float(&mut self, e: &Expr) -> VmResult<(ValueId, ValueId)> {
        let (v, m, _) = self.num(e, NumMode::Float)?;
        Ok((v, m))
    }

    /// Timestamp lanes of an expression.
    pub fn num_ts(&mut self, e: &Expr) -> VmResult<(ValueId, ValueId)> {
        let (v, m, _) = self.num(e, NumMode::Ts)?;
        Ok((v, m))
    }

    /// A field chain from the row root: `(value, validity mask)`.
    pub fn field(&mut self, path: &[String]) -> VmResult<(ValueId, ValueId)> {
        let mut parts = path.iter();
        let first = parts
            .next()
            .ok_or(CompileError::Unsupported("empty field path"))?;
        let mut v = self.b.load_field(self.base, first, self.entry);
        let mut mask = self.b.mask_of(v);
        for part in parts {
            v = self.b.dot(v, part, mask);
            mask = self.b.mask_of(v);
        }
        Ok((v, mask))
    }

    /// A boxed value register: `(value, definedness mask)`.
    pub fn value(&mut self, e: &Expr) -> VmResult<(ValueId, ValueId)> {
        match e {
            Expr::Path(p) => self.field(p),
            Expr::Int(v) => {
                let c = self.b.const_int(*v);
                let boxed = self.b.push(OpKind::BoxI, vec![c, self.entry], Type::Value);
                Ok((boxed, self.entry))
            }
            Expr::Float(v) => {
                let c = self.b.const_float(*v);
                let boxed = self.b.push(OpKind::BoxF, vec![c, self.entry], Type::Value);
                Ok((boxed, self.entry))
            }
            Expr::Ts(v) => {
                let c = self.b.const_ts(*v);
                let boxed = self.b.push(OpKind::BoxTs, vec![c, self.entry], Type::Value);
                Ok((boxed, self.entry))
            }
            Expr::Str(s) => {
                let mut c = Composer::new();
                c.put_string(s);
                Ok((self.b.lit_value(c.take()), self.entry))
            }
            Expr::Bool(v) => {
                let mut c = Composer::new();
                c.put_bool(*v);
                Ok((self.b.lit_value(c.take()), self.entry))
            }
            Expr::Null => {
                let mut c = Composer::new();
                c.put_null();
                Ok((self.b.lit_value(c.take()), self.entry))
            }
            Expr::Trim(_) | Expr::Substr(..) | Expr::Concat(..) => self.str_value(e),
            Expr::Bin(BinOp::And | BinOp::Or, ..)
            | Expr::Bin(
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge,
                ..,
            )
            | Expr::Un(UnOp::Not, _)
            | Expr::Like { .. }
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::In(..) => {
                let k = self.pred(e)?;
                let boxed = self
                    .b
                    .push(OpKind::BoxBool, vec![k, self.entry], Type::Value);
                Ok((boxed, self.entry))
            }
            _ => {
                let (lanes, mask, mode) = self.num(e, NumMode::Float)?;
                let op = match mode {
                    NumMode::Float => OpKind::BoxF,
                    NumMode::Int => OpKind::BoxI,
                    NumMode::Ts => OpKind::BoxTs,
                };
                let boxed = self.b.push(op, vec![lanes, mask], Type::Value);
                Ok((boxed, mask))
            }
        }
    }

    /// String byte lanes: `(value with headers stripped, validity mask)`.
    pub fn str_value(&mut self, e: &Expr) -> VmResult<(ValueId, ValueId)> {
        match e {
            Expr::Path(p) => {
                let (v, mask) = self.field(p)?;
                let s = self.b.push(OpKind::ToStr, vec![v, mask], Type::Value);
                let smask = self.b.mask_of(s);
                Ok((s, smask))
            }
            Expr::Str(lit) => {
                let mut c = Composer::new();
                c.put_string(lit);
                let v = self.b.lit_value(c.take());
                let s = self.b.push(OpKind::ToStr, vec![v, self.entry], Type::Value);
                let smask = self.b.mask_of(s);
                Ok((s, smask))
            }
            Expr::Trim(inner) => {
                let (s, mask) = self.str_value(inner)?;
                let t = self.b.push(OpKind::Trim(true, true), vec![s, mask], Type::Value);
                Ok((t, mask))
            }
            Expr::Substr(inner, start, len) => {
                let (s, smask) = self.str_value(inner)?;
                let (st, stmask, _) = self.num(start, NumMode::Int)?;
                let (ln, lnmask, _) = self.num(len, NumMode::Int)?;
                let m1 = self.b.and_mask(smask, stmask);
                let mask = self.b.and_mask(m1, lnmask);
                let v = self
                    .b
                    .push(OpKind::Substr, vec![s, st, ln, mask], Type::Value);
                Ok((v, mask))
            }
            Expr::Concat(a, b) => {
                let (sa, ma) = self.str_value(a)?;
                let (sb, mb) = self.str_value(b)?;
                let mask = self.b.and_mask(ma, mb);
                let v = self
                    .b
                    .push(OpKind::ConcatStr, vec![sa, sb, mask], Type::Value);
                Ok((v, mask))
            }
            _ => Err(CompileError::TypeMismatch {
                context: "string expression",
                expected: "string",
                found: "non-string",
            }
            .into()),
        }
    }

    /// Numeric lanes: `(scalar register, validity mask, mode)`.
    fn num(&mut self, e: &Expr, want: NumMode) -> VmResult<(ValueId, ValueId, NumMode)> {
        match e {
            Expr::Path(p) => {
                let (v, mask) = self.field(p)?;
                let (op, mode) = match want {
                    NumMode::Int => (OpKind::ToI64, NumMode::Int),
                    NumMode::Ts => (OpKind::ToTs, NumMode::Ts),
                    NumMode::Float => (OpKind::ToF64, NumMode::Float),
                };
                let lanes = self.b.push(op, vec![v, mask], Type::from_mode(mode));
                let lmask = self.b.mask_of(lanes);
                Ok((lanes, lmask, mode))
            }
            Expr::Int(v) => match want {
                NumMode::Float => Ok((self.b.const_float(*v as f64), self.entry, NumMode::Float)),
                _ => Ok((self.b.const_int(*v), self.entry, NumMode::Int)),
            },
            Expr::Float(v) => Ok((self.b.const_float(*v), self.entry, NumMode::Float)),
            Expr::Ts(v) => Ok((self.b.const_ts(*v), self.entry, NumMode::Ts)),
            Expr::StrLen(inner) => {
                let (s, mask) = self.str_value(inner)?;
                let lanes = self.b.push(OpKind::StrLen, vec![s, mask], Type::Int);
                let out = match want {
                    NumMode::Float => {
                        let f = self.b.push(OpKind::CvtI2F, vec![lanes, mask], Type::Float);
                        (f, mask, NumMode::Float)
                    }
                    _ => (lanes, mask, NumMode::Int),
                };
                Ok(out)
            }
            Expr::Bin(op @ (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod), a, b) => {
                let arith = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::Mul => ArithOp::Mul,
                    BinOp::Div => ArithOp::Div,
                    _ => ArithOp::Mod,
                };
                let mode = if want == NumMode::Int && a.int_capable() && b.int_capable() {
                    NumMode::Int
                } else {
                    NumMode::Float
                };
                let (va, ma, _) = self.num(a, mode)?;
                let (vb, mb, _) = self.num(b, mode)?;
                let mask = self.b.and_mask(ma, mb);
                let (kind, ty) = match mode {
                    NumMode::Int => (OpKind::ArithI(arith), Type::Int),
                    _ => (OpKind::ArithF(arith), Type::Float),
                };
                let res = self.b.push(kind, vec![va, vb, mask], ty);
                // Integer division narrows the mask to nonzero divisors.
                let rmask = if mode == NumMode::Int && matches!(arith, ArithOp::Div | ArithOp::Mod)
                {
                    self.b.mask_of(res)
                } else {
                    mask
                };
                Ok((res, rmask, mode))
            }
            Expr::Un(op, inner) => {
                let (math, int_ok) = match op {
                    UnOp::Neg => (MathOp::Neg, true),
                    UnOp::Abs => (MathOp::Abs, true),
                    UnOp::Sqrt => (MathOp::Sqrt, false),
                    UnOp::Floor => (MathOp::Floor, false),
                    UnOp::Ceil => (MathOp::Ceil, false),
                    UnOp::Round => (MathOp::Round, false),
                    UnOp::Ln => (MathOp::Ln, false),
                    UnOp::Log10 => (MathOp::Log10, false),
                    UnOp::Exp => (MathOp::Exp, false),
                    UnOp::Not => {
                        return Err(CompileError::TypeMismatch {
                            context: "numeric expression",
                            expected: "number",
                            found: "boolean",
                        }
                        .into())
                    }
                };
                let mode = if int_ok && want == NumMode::Int && inner.int_capable() {
                    NumMode::Int
                } else {
                    NumMode::Float
                };
                let (v, mask, _) = self.num(inner, mode)?;
                let (kind, ty) = match mode {
                    NumMode::Int => (OpKind::MathI(math), Type::Int),
                    _ => (OpKind::MathF(math), Type::Float),
                };
                Ok((self.b.push(kind, vec![v, mask], ty), mask, mode))
            }
            _ => Err(CompileError::TypeMismatch {
                context: "numeric expression",
                expected: "number",
                found: "non-numeric",
            }
            .into()),
        }
    }

    /// A predicate mask.
    pub fn pred(&mut self, e: &Expr) -> VmResult<ValueId> {
        match e {
            Expr::Bool(true) => Ok(self.entry),
            Expr::Bool(false) => Ok(self.b.false_mask()),
            Expr::Bin(BinOp::And, a, b) => {
                let (ka, kb) = (self.pred(a)?, self.pred(b)?);
                Ok(self.b.and_mask(ka, kb))
            }
            Expr::Bin(BinOp::Or, a, b) => {
                let (ka, kb) = (self.pred(a)?, self.pred(b)?);
                Ok(self.b.or_mask(ka, kb))
            }
            Expr::Un(UnOp::Not, inner) => {
                let k = self.pred(inner)?;
                Ok(self.b.andn_mask(k, self.entry))
            }
            Expr::Bin(
                op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge),
                a,
                b,
            ) => self.cmp(*op, a, b),
            Expr::Like { expr, pattern, ci } => {
                let (s, mask) = self.str_value(expr)?;
                Ok(self.b.push(
                    OpKind::Like {
                        pattern: pattern.clone(),
                        ci: *ci,
                    },
                    vec![s, mask],
                    Type::Mask,
                ))
            }
            Expr::IsNull(inner) => {
                let (v, mask) = self.value(inner)?;
                let null = self
                    .b
                    .push(OpKind::TypeIs(crate::ssa::TypePred::Null), vec![v, mask], Type::Mask);
                // Missing fields count as null too.
                let absent = self.b.andn_mask(mask, self.entry);
                Ok(self.b.or_mask(null, absent))
            }
            Expr::IsNotNull(inner) => {
                let null = self.pred(&Expr::IsNull(inner.clone()))?;
                Ok(self.b.andn_mask(null, self.entry))
            }
            Expr::In(inner, list) => {
                let (v, mask) = self.value(inner)?;
                let h = self.b.push(OpKind::HashV, vec![v, mask], Type::Hash);
                let encoded = list
                    .iter()
                    .map(|lit| {
                        let mut c = Composer::new();
                        match lit {
                            Expr::Int(v) => c.put_int(*v),
                            Expr::Float(v) => c.put_f64(*v),
                            Expr::Str(s) => c.put_string(s),
                            Expr::Bool(b) => c.put_bool(*b),
                            Expr::Ts(t) => c.put_timestamp(*t),
                            Expr::Null => c.put_null(),
                            _ => return Err(CompileError::Unsupported("non-literal IN list")),
                        }
                        Ok(c.take())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self
                    .b
                    .push(OpKind::HashMember(encoded), vec![h, mask], Type::Mask))
            }
            Expr::Path(_) => {
                let (v, mask) = self.value(e)?;
                Ok(self.b.push(
                    OpKind::TypeIs(crate::ssa::TypePred::True),
                    vec![v, mask],
                    Type::Mask,
                ))
            }
            _ => Err(CompileError::TypeMismatch {
                context: "predicate",
                expected: "boolean",
                found: "non-boolean",
            }
            .into()),
        }
    }

    fn cmp(&mut self, op: BinOp, a: &Expr, b: &Expr) -> VmResult<ValueId> {
        let cmp_op = match op {
            BinOp::Eq => CmpOp::Eq,
            BinOp::Ne => CmpOp::Ne,
            BinOp::Lt => CmpOp::Lt,
            BinOp::Le => CmpOp::Le,
            BinOp::Gt => CmpOp::Gt,
            _ => CmpOp::Ge,
        };

        // String-literal comparisons run the string kernels.
        if let Some(lit) = b.is_str_literal() {
            return self.cmp_str(cmp_op, a, lit);
        }
        if let Some(lit) = a.is_str_literal() {
            return self.cmp_str(cmp_op.swapped(), b, lit);
        }

        // Boolean-literal equality is a type predicate.
        if let (BinOp::Eq, Expr::Bool(val)) = (op, b) {
            let (v, mask) = self.value(a)?;
            let pred = if *val {
                crate::ssa::TypePred::True
            } else {
                crate::ssa::TypePred::False
            };
            return Ok(self.b.push(OpKind::TypeIs(pred), vec![v, mask], Type::Mask));
        }

        let mode = if a.has_ts_literal() || b.has_ts_literal() {
            NumMode::Ts
        } else if a.int_capable()
            && b.int_capable()
            && (a.has_int_literal() || b.has_int_literal())
        {
            NumMode::Int
        } else {
            NumMode::Float
        };
        let (va, ma, _) = self.num(a, mode)?;
        let (vb, mb, _) = self.num(b, mode)?;
        let mask = self.b.and_mask(ma, mb);
        let kind = match mode {
            NumMode::Float => OpKind::CmpF(cmp_op),
            _ => OpKind::CmpI(cmp_op),
        };
        Ok(self.b.push(kind, vec![va, vb, mask], Type::Mask))
    }

    fn cmp_str(&mut self, op: CmpOp, e: &Expr, lit: &str) -> VmResult<ValueId> {
        let (s, mask) = self.str_value(e)?;
        let lit = lit.to_owned();
        let mk = |b: &mut Builder, op, s, mask, lit: &str| {
            b.push(
                OpKind::CmpLitStr(op, CaseMode::Sensitive, lit.to_owned()),
                vec![s, mask],
                Type::Mask,
            )
        };
        Ok(match op {
            CmpOp::Eq | CmpOp::Lt | CmpOp::Gt => mk(self.b, op, s, mask, &lit),
            CmpOp::Ne => {
                let eq = mk(self.b, CmpOp::Eq, s, mask, &lit);
                self.b.andn_mask(eq, mask)
            }
            CmpOp::Le => {
                let lt = mk(self.b, CmpOp::Lt, s, mask, &lit);
                let eq = mk(self.b, CmpOp::Eq, s, mask, &lit);
                self.b.or_mask(lt, eq)
            }
            CmpOp::Ge => {
                let lt = mk(self.b, CmpOp::Lt, s, mask, &lit);
                self.b.andn_mask(lt, mask)
            }
        })
    }

    /// Prefix/suffix/containment sugar used by the engine façade.
    pub fn str_test(
        &mut self,
        kind: StrTestKind,
        e: &Expr,
        needle: &str,
        ci: bool,
    ) -> VmResult<ValueId> {
        let (s, mask) = self.str_value(e)?;
        let mode = if ci {
            CaseMode::AsciiCi
        } else {
            CaseMode::Sensitive
        };
        Ok(self.b.push(
            OpKind::StrTest(kind, mode, needle.to_owned()),
            vec![s, mask],
            Type::Mask,
        ))
    }
}

impl Type {
    fn from_mode(mode: NumMode) -> Type {
        match mode {
            NumMode::Int => Type::Int,
            NumMode::Float => Type::Float,
            NumMode::Ts => Type::Ts,
        }
    }
}

/// One aggregate output of an aggregation query.
#[derive(Debug, Clone)]
pub struct AggSpec {
    /// Output label.
    pub label: String,
    /// The aggregate function.
    pub kind: AggKind,
    /// Aggregated expression; `None` for `COUNT(*)`.
    pub arg: Option<Expr>,
    /// Optional `FILTER (WHERE ...)` predicate.
    pub filter: Option<Expr>,
}

/// Compile a filter predicate into a mask-returning program.
pub fn compile_filter(expr: &Expr) -> VmResult<Prog> {
    let mut b = Builder::new();
    let mem = b.init_mem();
    let mut ctx = ExprCtx::new(&mut b);
    let mask = ctx.pred(expr)?;
    b.ret_bool(mem, mask);
    Ok(b.finish())
}

/// Compile projection bindings; binding `i` lands in auxiliary output `i`.
pub fn compile_projection(bindings: &[(String, Expr)]) -> VmResult<Prog> {
    let mut b = Builder::new();
    let mut mem = b.init_mem();
    let mut ctx = ExprCtx::new(&mut b);
    let mut stores = Vec::with_capacity(bindings.len());
    for (i, (_, expr)) in bindings.iter().enumerate() {
        let (v, mask) = ctx.value(expr)?;
        stores.push((i as u16, v, mask));
    }
    for (i, v, mask) in stores {
        mem = b.store(mem, i, v, mask);
    }
    b.ret(mem);
    Ok(b.finish())
}

/// Compile a set of aggregates (with optional filters) into a sink program.
///
/// Aggregate `i` writes the slot at `i * AGG_SLOT_SIZE`. Duplicate filter
/// predicates and argument subexpressions collapse in the optimizer.
pub fn compile_aggregates(specs: &[AggSpec]) -> VmResult<Prog> {
    let mut b = Builder::new();
    let mut mem = b.init_mem();
    let mut ctx = ExprCtx::new(&mut b);
    let entry = ctx.entry();

    let mut emitted = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let filter_mask = match &spec.filter {
            Some(f) => ctx.pred(f)?,
            None => entry,
        };
        let args = agg_args(&mut ctx, spec, filter_mask)?;
        emitted.push((AggBufferSlot(i as u32), spec.kind, args));
    }
    for (slot, kind, mut args) in emitted {
        let mut full = vec![mem];
        full.append(&mut args);
        mem = b.push(
            OpKind::Agg(kind, slot.offset()),
            full,
            crate::ssa::Type::Mem,
        );
    }
    b.ret(mem);
    Ok(b.finish())
}

struct AggBufferSlot(u32);

impl AggBufferSlot {
    fn offset(&self) -> u32 {
        self.0 * AGG_SLOT_SIZE as u32
    }
}

fn agg_args(
    ctx: &mut ExprCtx<'_>,
    spec: &AggSpec,
    filter_mask: ValueId,
) -> VmResult<Vec<ValueId>> {
    use AggKind::*;
    Ok(match spec.kind {
        Count => vec![filter_mask],
        AndBool | OrBool => {
            let arg = spec
                .arg
                .as_ref()
                .ok_or(CompileError::Unsupported("boolean aggregate without argument"))?;
            let k = ctx.pred(arg)?;
            vec![k, filter_mask]
        }
        ApproxCount => {
            let arg = spec
                .arg
                .as_ref()
                .ok_or(CompileError::Unsupported("approx count without argument"))?;
            let (v, vmask) = ctx.value(arg)?;
            let mask = ctx.b.and_mask(vmask, filter_mask);
            let h = ctx.b.push(OpKind::HashV, vec![v, mask], Type::Hash);
            vec![h, mask]
        }
        _ => {
            let arg = spec
                .arg
                .as_ref()
                .ok_or(CompileError::Unsupported("aggregate without argument"))?;
            let mode = match spec.kind {
                SumF | AvgF | MinF | MaxF => NumMode::Float,
                MinTs | MaxTs => NumMode::Ts,
                _ => NumMode::Int,
            };
            let (lanes, lmask, _) = ctx.num(arg, mode)?;
            let mask = ctx.b.and_mask(lmask, filter_mask);
            vec![lanes, mask]
        }
    })
}

/// Compile grouped aggregation: group-key hashing, bucket resolution and
/// per-slot writes. Key `j` is also stored to auxiliary output `j` so the
/// driver can record first-seen key bytes.
pub fn compile_grouped(group_by: &[Expr], specs: &[AggSpec]) -> VmResult<Prog> {
    if group_by.is_empty() {
        return Err(CompileError::Unsupported("grouped aggregation without keys").into());
    }
    let stride = (specs.len() * AGG_SLOT_SIZE) as u32;
    if stride > u16::MAX as u32 {
        return Err(CompileError::SlotExhausted.into());
    }

    let mut b = Builder::new();
    let mut mem = b.init_mem();
    let mut ctx = ExprCtx::new(&mut b);

    // Hash chain over the key columns; a lane must have every key present.
    let mut keys = Vec::with_capacity(group_by.len());
    let mut mask = ctx.entry();
    for e in group_by {
        let (v, vmask) = ctx.value(e)?;
        mask = ctx.b.and_mask(mask, vmask);
        keys.push(v);
    }
    let mut h = ctx.b.push(OpKind::HashV, vec![keys[0], mask], Type::Hash);
    for &key in &keys[1..] {
        h = ctx.b.push(OpKind::HashMix, vec![h, key, mask], Type::Hash);
    }
    let bucket = ctx.b.push(OpKind::Bucket, vec![h, mask], Type::Lanes);

    for (j, &key) in keys.iter().enumerate() {
        mem = ctx.b.store(mem, j as u16, key, mask);
    }

    let mut emitted = Vec::with_capacity(specs.len());
    for (j, spec) in specs.iter().enumerate() {
        let filter_mask = match &spec.filter {
            Some(f) => {
                let f = ctx.pred(f)?;
                ctx.b.and_mask(mask, f)
            }
            None => mask,
        };
        let packed = stride << 16 | (j * AGG_SLOT_SIZE) as u32;
        let args = match spec.kind {
            AggKind::Count => vec![bucket, filter_mask],
            _ => {
                let arg = spec
                    .arg
                    .as_ref()
                    .ok_or(CompileError::Unsupported("aggregate without argument"))?;
                let mode = if spec.kind.takes_float() {
                    NumMode::Float
                } else {
                    NumMode::Int
                };
                let (lanes, lmask, _) = ctx.num(arg, mode)?;
                let m = ctx.b.and_mask(lmask, filter_mask);
                vec![bucket, lanes, m]
            }
        };
        emitted.push((spec.kind, packed, args));
    }
    for (kind, packed, mut args) in emitted {
        let mut full = vec![mem];
        full.append(&mut args);
        mem = b.push(OpKind::AggSlot(kind, packed), full, Type::Mem);
    }
    b.ret(mem);
    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::optimize;

    #[test]
    fn filter_compiles_to_mask_program() {
        let expr = Expr::bin(BinOp::Lt, Expr::path("passenger_count"), Expr::Int(3));
        let prog = compile_filter(&expr).unwrap();
        let opt = optimize(&prog);
        // Integer literal comparisons take the integer path, folded to the
        // immediate form.
        assert!(opt
            .values
            .iter()
            .any(|v| matches!(v.kind, OpKind::CmpImmI(CmpOp::Lt, 3))));
        assert!(opt.values.iter().any(|v| matches!(v.kind, OpKind::ToI64)));
    }

    #[test]
    fn float_literal_comparisons_take_the_float_path() {
        let expr = Expr::bin(BinOp::Lt, Expr::path("trip_distance"), Expr::Float(2.5));
        let opt = optimize(&compile_filter(&expr).unwrap());
        assert!(opt
            .values
            .iter()
            .any(|v| matches!(v.kind, OpKind::CmpImmF(CmpOp::Lt, _))));
        assert!(opt.values.iter().any(|v| matches!(v.kind, OpKind::ToF64)));
    }

    #[test]
    fn duplicate_aggregate_filters_share_compares() {
        // Mirrors the FILTER census: 3 counts, 2 sums, 2 avgs over two
        // distinct predicates compile to exactly one less-imm and one
        // greater-imm comparison after CSE (per predicate).
        let gt = Expr::bin(BinOp::Gt, Expr::path("x"), Expr::Int(0));
        let lt = Expr::bin(BinOp::Lt, Expr::path("x"), Expr::Int(0));
        let spec = |kind, filter: &Expr| AggSpec {
            label: String::new(),
            kind,
            arg: Some(Expr::path("x")),
            filter: Some(filter.clone()),
        };
        let specs = vec![
            AggSpec {
                label: String::new(),
                kind: AggKind::Count,
                arg: None,
                filter: Some(gt.clone()),
            },
            AggSpec {
                label: String::new(),
                kind: AggKind::Count,
                arg: None,
                filter: Some(lt.clone()),
            },
            AggSpec {
                label: String::new(),
                kind: AggKind::Count,
                arg: None,
                filter: Some(gt.clone()),
            },
            spec(AggKind::SumF, &gt),
            spec(AggKind::SumF, &lt),
            spec(AggKind::AvgF, &gt),
            spec(AggKind::AvgF, &lt),
        ];
        let opt = optimize(&compile_aggregates(&specs).unwrap());

        let count = |f: &dyn Fn(&OpKind) -> bool| opt.values.iter().filter(|v| f(&v.kind)).count();
        assert_eq!(count(&|k| matches!(k, OpKind::CmpImmI(CmpOp::Gt, 0))), 1);
        assert_eq!(count(&|k| matches!(k, OpKind::CmpImmI(CmpOp::Lt, 0))), 1);
        assert_eq!(count(&|k| matches!(k, OpKind::Agg(AggKind::Count, _))), 3);
        assert_eq!(count(&|k| matches!(k, OpKind::Agg(AggKind::SumF, _))), 2);
        assert_eq!(count(&|k| matches!(k, OpKind::Agg(AggKind::AvgF, _))), 2);
    }

    #[test]
    fn string_inequality_composes_from_primitives() {
        let expr = Expr::bin(BinOp::Ne, Expr::path("name"), Expr::Str("x".into()));
        let prog = compile_filter(&expr).unwrap();
        assert!(prog
            .values
            .iter()
            .any(|v| matches!(&v.kind, OpKind::CmpLitStr(CmpOp::Eq, CaseMode::Sensitive, s) if s == "x")));
        assert!(prog.values.iter().any(|v| matches!(v.kind, OpKind::MaskAndn)));
    }
}
