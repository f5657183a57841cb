//! The opcode table.
//!
//! Instructions encode as a little-endian `u16` opcode, then the destination
//! slots implied by the output shape, then the operands in the declared
//! order and widths. All vector operations consume and produce 16 lanes
//! under the predicate mask named by their `Mask` operand.

use crate::args::{ArgClass, OutKind};

/// Failed to map a `u16` onto a defined opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvalidOpcode;

impl core::fmt::Display for InvalidOpcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid opcode")
    }
}

impl std::error::Error for InvalidOpcode {}

impl_opcodes! {
    // -- control, masks and moves -------------------------------------------
    "End of program; no outputs."
    0x000 RET ret [] None 0
    "End of program, returning a lane mask."
    0x001 RET_K ret_k [Mask] None 0
    "End of program, returning a value register and its mask."
    0x002 RET_V ret_v [Slot Mask] None 0
    "Abort the program, storing the fault code from the immediate."
    0x003 ABORT abort [Imm16] None 0
    "Load the caller's entry mask."
    0x004 INIT_K init_k [] Mask 0
    "Load the row-base register prepared by the caller."
    0x005 INIT_B init_b [] Base 0
    "Produce an all-false mask."
    0x006 FALSE_K false_k [] Mask 0
    "Copy a mask."
    0x007 MOV_K mov_k [Mask] Mask 0
    "Lane-wise AND of two masks."
    0x008 AND_K and_k [Mask Mask] Mask 0
    "Lane-wise OR of two masks."
    0x009 OR_K or_k [Mask Mask] Mask 0
    "Lane-wise XOR of two masks."
    0x00A XOR_K xor_k [Mask Mask] Mask 0
    "Lane-wise AND-NOT: clears the second mask's lanes where the first is set."
    0x00B ANDN_K andn_k [Mask Mask] Mask 0
    "Copy a scalar register."
    0x00C MOV_S mov_s [Slot] Scalar 0
    "Copy a value register."
    0x00D MOV_V mov_v [Slot] Value 0
    "Copy a base register."
    0x00E MOV_B mov_b [Base] Base 0

    // -- broadcasts ---------------------------------------------------------
    "Broadcast a signed integer immediate to all lanes."
    0x010 BROADCAST_I broadcast_i [ImmI64] Scalar 0
    "Broadcast a float immediate to all lanes."
    0x011 BROADCAST_F broadcast_f [ImmF64] Scalar 0
    "Broadcast a timestamp immediate (epoch microseconds) to all lanes."
    0x012 BROADCAST_TS broadcast_ts [ImmI64] Scalar 0
    "Broadcast an interned literal value to all lanes."
    0x013 BROADCAST_LIT broadcast_lit [LitRef] Value 0

    // -- field access -------------------------------------------------------
    "Scan each lane's struct for a symbol; mask bit set on hit."
    0x020 FINDSYM findsym [Base Symbol Mask] ValueMask 0
    "Reinterpret a struct value as a base register for nested lookups."
    0x021 TUPLE tuple [Slot Mask] Base 0
    "Select the n-th element of each lane's list."
    0x022 INDEX_LIST index_list [Slot Imm16 Mask] ValueMask 0

    // -- unboxing -----------------------------------------------------------
    "Unbox integer lanes; drops lanes that are not integers."
    0x030 TO_I64 to_i64 [Slot Mask] ScalarMask 0
    "Unbox numeric lanes as floats; integers convert."
    0x031 TO_F64 to_f64 [Slot Mask] ScalarMask 0
    "Unbox timestamp lanes as epoch microseconds."
    0x032 TO_TS to_ts [Slot Mask] ScalarMask 0
    "Strip string headers, leaving references to the raw bytes."
    0x033 TO_STR to_str [Slot Mask] ValueMask 0
    "Unbox symbol lanes as their interned identifiers."
    0x034 TO_SYM to_sym [Slot Mask] ScalarMask 0

    // -- type predicates ----------------------------------------------------
    "Mask of lanes holding any null."
    0x040 IS_NULL is_null [Slot Mask] Mask 0
    "Mask of lanes holding a boolean."
    0x041 IS_BOOL is_bool [Slot Mask] Mask 0
    "Mask of lanes holding an integer."
    0x042 IS_INT is_int [Slot Mask] Mask 0
    "Mask of lanes holding a float."
    0x043 IS_FLOAT is_float [Slot Mask] Mask 0
    "Mask of lanes holding any numeric value."
    0x044 IS_NUMBER is_number [Slot Mask] Mask 0
    "Mask of lanes holding a string."
    0x045 IS_STRING is_string [Slot Mask] Mask 0
    "Mask of lanes holding a symbol."
    0x046 IS_SYMBOL is_symbol [Slot Mask] Mask 0
    "Mask of lanes holding a timestamp."
    0x047 IS_TS is_ts [Slot Mask] Mask 0
    "Mask of lanes holding a list."
    0x048 IS_LIST is_list [Slot Mask] Mask 0
    "Mask of lanes holding a struct."
    0x049 IS_STRUCT is_struct [Slot Mask] Mask 0
    "Mask of lanes holding boolean true."
    0x04A IS_TRUE is_true [Slot Mask] Mask 0
    "Mask of lanes holding boolean false."
    0x04B IS_FALSE is_false [Slot Mask] Mask 0
    "Mask of lanes whose type tag is in the immediate bitset."
    0x04C CHECK_TAG check_tag [Slot Imm16 Mask] Mask 0

    // -- integer arithmetic -------------------------------------------------
    "Wrapping lane-wise integer add."
    0x050 ADD_I add_i [Slot Slot Mask] Scalar 0
    "Wrapping lane-wise integer subtract."
    0x051 SUB_I sub_i [Slot Slot Mask] Scalar 0
    "Wrapping lane-wise integer multiply."
    0x052 MUL_I mul_i [Slot Slot Mask] Scalar 0
    "Lane-wise integer divide; zero divisors drop out of the mask."
    0x053 DIV_I div_i [Slot Slot Mask] ScalarMask 0
    "Lane-wise integer remainder; zero divisors drop out of the mask."
    0x054 MOD_I mod_i [Slot Slot Mask] ScalarMask 0
    "Lane-wise integer minimum."
    0x055 MIN_I min_i [Slot Slot Mask] Scalar 0
    "Lane-wise integer maximum."
    0x056 MAX_I max_i [Slot Slot Mask] Scalar 0
    "Lane-wise integer absolute value."
    0x057 ABS_I abs_i [Slot Mask] Scalar 0
    "Lane-wise integer negation."
    0x058 NEG_I neg_i [Slot Mask] Scalar 0
    "Add an integer immediate to every lane."
    0x059 ADD_IMM_I add_imm_i [Slot ImmI64 Mask] Scalar 0
    "Subtract an integer immediate from every lane."
    0x05A SUB_IMM_I sub_imm_i [Slot ImmI64 Mask] Scalar 0
    "Multiply every lane by an integer immediate."
    0x05B MUL_IMM_I mul_imm_i [Slot ImmI64 Mask] Scalar 0
    "Divide every lane by an integer immediate; zero drops all lanes."
    0x05C DIV_IMM_I div_imm_i [Slot ImmI64 Mask] ScalarMask 0
    "Remainder of every lane by an integer immediate."
    0x05D MOD_IMM_I mod_imm_i [Slot ImmI64 Mask] ScalarMask 0

    // -- bitwise ------------------------------------------------------------
    "Lane-wise bitwise AND."
    0x060 AND_I and_i [Slot Slot Mask] Scalar 0
    "Lane-wise bitwise OR."
    0x061 OR_I or_i [Slot Slot Mask] Scalar 0
    "Lane-wise bitwise XOR."
    0x062 XOR_I xor_i [Slot Slot Mask] Scalar 0
    "Lane-wise logical shift left; shifts past 63 produce zero."
    0x063 SLL_I sll_i [Slot Slot Mask] Scalar 0
    "Lane-wise logical shift right."
    0x064 SRL_I srl_i [Slot Slot Mask] Scalar 0
    "Lane-wise arithmetic shift right."
    0x065 SRA_I sra_i [Slot Slot Mask] Scalar 0
    "Bitwise AND with an immediate."
    0x066 AND_IMM_I and_imm_i [Slot ImmI64 Mask] Scalar 0
    "Bitwise OR with an immediate."
    0x067 OR_IMM_I or_imm_i [Slot ImmI64 Mask] Scalar 0
    "Bitwise XOR with an immediate."
    0x068 XOR_IMM_I xor_imm_i [Slot ImmI64 Mask] Scalar 0
    "Logical shift left by an immediate."
    0x069 SLL_IMM_I sll_imm_i [Slot ImmI64 Mask] Scalar 0
    "Logical shift right by an immediate."
    0x06A SRL_IMM_I srl_imm_i [Slot ImmI64 Mask] Scalar 0
    "Arithmetic shift right by an immediate."
    0x06B SRA_IMM_I sra_imm_i [Slot ImmI64 Mask] Scalar 0

    // -- float arithmetic ---------------------------------------------------
    "Lane-wise float add."
    0x080 ADD_F add_f [Slot Slot Mask] Scalar 0
    "Lane-wise float subtract."
    0x081 SUB_F sub_f [Slot Slot Mask] Scalar 0
    "Lane-wise float multiply."
    0x082 MUL_F mul_f [Slot Slot Mask] Scalar 0
    "Lane-wise float divide."
    0x083 DIV_F div_f [Slot Slot Mask] Scalar 0
    "Lane-wise float minimum; NaN loses."
    0x084 MIN_F min_f [Slot Slot Mask] Scalar 0
    "Lane-wise float maximum; NaN loses."
    0x085 MAX_F max_f [Slot Slot Mask] Scalar 0
    "Lane-wise float absolute value."
    0x086 ABS_F abs_f [Slot Mask] Scalar 0
    "Lane-wise float negation."
    0x087 NEG_F neg_f [Slot Mask] Scalar 0
    "Lane-wise square root."
    0x088 SQRT_F sqrt_f [Slot Mask] Scalar 0
    "Lane-wise cube root."
    0x089 CBRT_F cbrt_f [Slot Mask] Scalar 0
    "Lane-wise natural exponential."
    0x08A EXP_F exp_f [Slot Mask] Scalar 0
    "Lane-wise exp(x) - 1."
    0x08B EXPM1_F expm1_f [Slot Mask] Scalar 0
    "Lane-wise natural logarithm."
    0x08C LN_F ln_f [Slot Mask] Scalar 0
    "Lane-wise ln(1 + x)."
    0x08D LN1P_F ln1p_f [Slot Mask] Scalar 0
    "Lane-wise base-2 logarithm."
    0x08E LOG2_F log2_f [Slot Mask] Scalar 0
    "Lane-wise base-10 logarithm."
    0x08F LOG10_F log10_f [Slot Mask] Scalar 0
    "Lane-wise sine."
    0x090 SIN_F sin_f [Slot Mask] Scalar 0
    "Lane-wise cosine."
    0x091 COS_F cos_f [Slot Mask] Scalar 0
    "Lane-wise tangent."
    0x092 TAN_F tan_f [Slot Mask] Scalar 0
    "Lane-wise arcsine."
    0x093 ASIN_F asin_f [Slot Mask] Scalar 0
    "Lane-wise arccosine."
    0x094 ACOS_F acos_f [Slot Mask] Scalar 0
    "Lane-wise arctangent."
    0x095 ATAN_F atan_f [Slot Mask] Scalar 0
    "Lane-wise two-argument arctangent."
    0x096 ATAN2_F atan2_f [Slot Slot Mask] Scalar 0
    "Lane-wise power."
    0x097 POW_F pow_f [Slot Slot Mask] Scalar 0
    "Lane-wise euclidean distance from the origin."
    0x098 HYPOT_F hypot_f [Slot Slot Mask] Scalar 0
    "Add a float immediate to every lane."
    0x099 ADD_IMM_F add_imm_f [Slot ImmF64 Mask] Scalar 0
    "Subtract a float immediate from every lane."
    0x09A SUB_IMM_F sub_imm_f [Slot ImmF64 Mask] Scalar 0
    "Multiply every lane by a float immediate."
    0x09B MUL_IMM_F mul_imm_f [Slot ImmF64 Mask] Scalar 0
    "Divide every lane by a float immediate."
    0x09C DIV_IMM_F div_imm_f [Slot ImmF64 Mask] Scalar 0
    "Round lanes toward negative infinity."
    0x09D FLOOR_F floor_f [Slot Mask] Scalar 0
    "Round lanes toward positive infinity."
    0x09E CEIL_F ceil_f [Slot Mask] Scalar 0
    "Round lanes toward zero."
    0x09F TRUNC_F trunc_f [Slot Mask] Scalar 0
    "Round lanes half away from zero."
    0x0A0 ROUND_F round_f [Slot Mask] Scalar 0
    "Round lanes half to even."
    0x0A1 ROUND_EVEN_F round_even_f [Slot Mask] Scalar 0
    "Convert integer lanes to float."
    0x0A2 CVT_I2F cvt_i2f [Slot Mask] Scalar 0
    "Convert float lanes to integer, truncating; NaN and out-of-range drop."
    0x0A3 CVT_F2I cvt_f2i [Slot Mask] ScalarMask 0
    "Convert float lanes to integer, flooring first."
    0x0A4 CVT_FLOOR_F2I cvt_floor_f2i [Slot Mask] ScalarMask 0
    "Convert float lanes to integer, ceiling first."
    0x0A5 CVT_CEIL_F2I cvt_ceil_f2i [Slot Mask] ScalarMask 0

    // -- comparisons --------------------------------------------------------
    "Integer equality mask."
    0x0C0 CMP_EQ_I cmp_eq_i [Slot Slot Mask] Mask 0
    "Integer inequality mask."
    0x0C1 CMP_NE_I cmp_ne_i [Slot Slot Mask] Mask 0
    "Integer less-than mask."
    0x0C2 CMP_LT_I cmp_lt_i [Slot Slot Mask] Mask 0
    "Integer less-or-equal mask."
    0x0C3 CMP_LE_I cmp_le_i [Slot Slot Mask] Mask 0
    "Integer greater-than mask."
    0x0C4 CMP_GT_I cmp_gt_i [Slot Slot Mask] Mask 0
    "Integer greater-or-equal mask."
    0x0C5 CMP_GE_I cmp_ge_i [Slot Slot Mask] Mask 0
    "Integer equality against an immediate."
    0x0C6 CMP_EQ_IMM_I cmp_eq_imm_i [Slot ImmI64 Mask] Mask 0
    "Integer inequality against an immediate."
    0x0C7 CMP_NE_IMM_I cmp_ne_imm_i [Slot ImmI64 Mask] Mask 0
    "Integer less-than against an immediate."
    0x0C8 CMP_LT_IMM_I cmp_lt_imm_i [Slot ImmI64 Mask] Mask 0
    "Integer less-or-equal against an immediate."
    0x0C9 CMP_LE_IMM_I cmp_le_imm_i [Slot ImmI64 Mask] Mask 0
    "Integer greater-than against an immediate."
    0x0CA CMP_GT_IMM_I cmp_gt_imm_i [Slot ImmI64 Mask] Mask 0
    "Integer greater-or-equal against an immediate."
    0x0CB CMP_GE_IMM_I cmp_ge_imm_i [Slot ImmI64 Mask] Mask 0
    "Float equality mask; NaN lanes drop."
    0x0CC CMP_EQ_F cmp_eq_f [Slot Slot Mask] Mask 0
    "Float inequality mask; NaN lanes drop."
    0x0CD CMP_NE_F cmp_ne_f [Slot Slot Mask] Mask 0
    "Float less-than mask; NaN lanes drop."
    0x0CE CMP_LT_F cmp_lt_f [Slot Slot Mask] Mask 0
    "Float less-or-equal mask; NaN lanes drop."
    0x0CF CMP_LE_F cmp_le_f [Slot Slot Mask] Mask 0
    "Float greater-than mask; NaN lanes drop."
    0x0D0 CMP_GT_F cmp_gt_f [Slot Slot Mask] Mask 0
    "Float greater-or-equal mask; NaN lanes drop."
    0x0D1 CMP_GE_F cmp_ge_f [Slot Slot Mask] Mask 0
    "Float equality against an immediate; NaN lanes drop."
    0x0D2 CMP_EQ_IMM_F cmp_eq_imm_f [Slot ImmF64 Mask] Mask 0
    "Float inequality against an immediate; NaN lanes drop."
    0x0D3 CMP_NE_IMM_F cmp_ne_imm_f [Slot ImmF64 Mask] Mask 0
    "Float less-than against an immediate; NaN lanes drop."
    0x0D4 CMP_LT_IMM_F cmp_lt_imm_f [Slot ImmF64 Mask] Mask 0
    "Float less-or-equal against an immediate; NaN lanes drop."
    0x0D5 CMP_LE_IMM_F cmp_le_imm_f [Slot ImmF64 Mask] Mask 0
    "Float greater-than against an immediate; NaN lanes drop."
    0x0D6 CMP_GT_IMM_F cmp_gt_imm_f [Slot ImmF64 Mask] Mask 0
    "Float greater-or-equal against an immediate; NaN lanes drop."
    0x0D7 CMP_GE_IMM_F cmp_ge_imm_f [Slot ImmF64 Mask] Mask 0
    "Raw encoded-value equality of two value registers."
    0x0D8 CMP_EQ_V cmp_eq_v [Slot Slot Mask] Mask 0
    "Order comparator over two value registers: lanes of -1, 0 or 1."
    0x0D9 SORTCMP_V sortcmp_v [Slot Slot Mask] Scalar 0
    "Case-sensitive string equality against a literal."
    0x0DA CMP_LIT_EQ_CS cmp_lit_eq_cs [Slot LitRef Mask] Mask 0
    "ASCII case-insensitive string equality against a literal."
    0x0DB CMP_LIT_EQ_CI cmp_lit_eq_ci [Slot LitRef Mask] Mask 0
    "Unicode case-insensitive equality against a case-folded needle."
    0x0DC CMP_LIT_EQ_UTF8_CI cmp_lit_eq_utf8_ci [Slot DictRef Mask] Mask 0
    "Case-sensitive string less-than against a literal."
    0x0DD CMP_LIT_LT_CS cmp_lit_lt_cs [Slot LitRef Mask] Mask 0
    "Case-sensitive string greater-than against a literal."
    0x0DE CMP_LIT_GT_CS cmp_lit_gt_cs [Slot LitRef Mask] Mask 0

    // -- timestamps ---------------------------------------------------------
    "Extract the calendar year from timestamp lanes."
    0x0F0 TS_YEAR ts_year [Slot Mask] Scalar 0
    "Extract the month (1-12) from timestamp lanes."
    0x0F1 TS_MONTH ts_month [Slot Mask] Scalar 0
    "Extract the day of month (1-31) from timestamp lanes."
    0x0F2 TS_DAY ts_day [Slot Mask] Scalar 0
    "Extract the hour (0-23) from timestamp lanes."
    0x0F3 TS_HOUR ts_hour [Slot Mask] Scalar 0
    "Extract the minute (0-59) from timestamp lanes."
    0x0F4 TS_MINUTE ts_minute [Slot Mask] Scalar 0
    "Extract the second (0-59) from timestamp lanes."
    0x0F5 TS_SECOND ts_second [Slot Mask] Scalar 0
    "Add a microsecond interval immediate to timestamp lanes."
    0x0F6 TS_ADD ts_add [Slot ImmI64 Mask] Scalar 0
    "Floor timestamp lanes to a multiple of the immediate interval."
    0x0F7 TS_BUCKET ts_bucket [Slot ImmI64 Mask] Scalar 0

    // -- strings ------------------------------------------------------------
    "Mask of lanes whose string starts with the literal."
    0x100 HAS_PREFIX_CS has_prefix_cs [Slot LitRef Mask] Mask 0
    "Mask of lanes whose string starts with the literal, ASCII case-folded."
    0x101 HAS_PREFIX_CI has_prefix_ci [Slot LitRef Mask] Mask 0
    "Mask of lanes whose string ends with the literal."
    0x102 HAS_SUFFIX_CS has_suffix_cs [Slot LitRef Mask] Mask 0
    "Mask of lanes whose string ends with the literal, ASCII case-folded."
    0x103 HAS_SUFFIX_CI has_suffix_ci [Slot LitRef Mask] Mask 0
    "Mask of lanes whose string contains the literal."
    0x104 CONTAINS_CS contains_cs [Slot LitRef Mask] Mask 0
    "Mask of lanes whose string contains the literal, ASCII case-folded."
    0x105 CONTAINS_CI contains_ci [Slot LitRef Mask] Mask 0
    "Match lanes against a compiled wildcard pattern."
    0x106 LIKE like [Slot DictRef Mask] Mask 0
    "Match lanes against a compiled wildcard pattern, case-folded."
    0x107 LIKE_CI like_ci [Slot DictRef Mask] Mask 0
    "Byte length of each lane's string."
    0x108 STR_LEN str_len [Slot Mask] Scalar 0
    "Strip leading and trailing ASCII whitespace."
    0x109 TRIM_WS trim_ws [Slot Mask] Value 0
    "Strip leading ASCII whitespace."
    0x10A TRIM_WS_LEFT trim_ws_left [Slot Mask] Value 0
    "Strip trailing ASCII whitespace."
    0x10B TRIM_WS_RIGHT trim_ws_right [Slot Mask] Value 0
    "Substring of each lane: 1-based start lanes and length lanes."
    0x10C SUBSTR substr [Slot Slot Slot Mask] Value 0
    "Concatenate two string registers into scratch."
    0x10D CONCAT_STR concat_str [Slot Slot Mask] Value 0

    // -- boxing -------------------------------------------------------------
    "Box integer lanes into scratch, returning references."
    0x120 BOX_I box_i [Slot Mask] Value 144
    "Box float lanes into scratch, returning references."
    0x121 BOX_F box_f [Slot Mask] Value 144
    "Box timestamp lanes into scratch, returning references."
    0x122 BOX_TS box_ts [Slot Mask] Value 144
    "Box boolean lanes (first mask: values) into scratch."
    0x123 BOX_BOOL box_bool [Mask Mask] Value 16

    // -- hashing and grouping -----------------------------------------------
    "128-bit hash of each lane's encoded value."
    0x130 HASH_V hash_v [Slot Mask] Hash 0
    "Fold another column's value into existing lane hashes."
    0x131 HASH_MIX hash_mix [Slot Slot Mask] Hash 0
    "Mask of lanes whose hash is in the dictionary set."
    0x132 HASH_MEMBER hash_member [Slot DictRef Mask] Mask 0
    "Map lane hashes to stored values through a dictionary table."
    0x133 HASH_LOOKUP hash_lookup [Slot DictRef Mask] ValueMask 0
    "Assign each lane's hash a dense group slot via the bound group table."
    0x134 BUCKET bucket [Slot Mask] Lanes 0

    // -- geo ----------------------------------------------------------------
    "Geohash string of lat/lon lanes at the immediate precision."
    0x138 GEO_HASH geo_hash [Slot Slot Imm16 Mask] Value 208
    "Web-mercator tile X of longitude lanes at zoom lanes."
    0x139 GEO_TILE_X geo_tile_x [Slot Slot Mask] Scalar 0
    "Web-mercator tile Y of latitude lanes at zoom lanes."
    0x13A GEO_TILE_Y geo_tile_y [Slot Slot Mask] Scalar 0
    "Great-circle distance in meters between two lat/lon lane pairs."
    0x13B GEO_DISTANCE geo_distance [Slot Slot Slot Slot Mask] Scalar 0

    // -- scalar aggregation -------------------------------------------------
    "Compensated float sum into an aggregation slot."
    0x140 AGG_SUM_F agg_sum_f [AggSlot Slot Mask] None 0
    "Integer sum into an aggregation slot."
    0x141 AGG_SUM_I agg_sum_i [AggSlot Slot Mask] None 0
    "Compensated float average (sum and count) into an aggregation slot."
    0x142 AGG_AVG_F agg_avg_f [AggSlot Slot Mask] None 0
    "Integer average (sum and count) into an aggregation slot."
    0x143 AGG_AVG_I agg_avg_i [AggSlot Slot Mask] None 0
    "Float minimum into an aggregation slot."
    0x144 AGG_MIN_F agg_min_f [AggSlot Slot Mask] None 0
    "Float maximum into an aggregation slot."
    0x145 AGG_MAX_F agg_max_f [AggSlot Slot Mask] None 0
    "Integer minimum into an aggregation slot."
    0x146 AGG_MIN_I agg_min_i [AggSlot Slot Mask] None 0
    "Integer maximum into an aggregation slot."
    0x147 AGG_MAX_I agg_max_i [AggSlot Slot Mask] None 0
    "Timestamp minimum into an aggregation slot."
    0x148 AGG_MIN_TS agg_min_ts [AggSlot Slot Mask] None 0
    "Timestamp maximum into an aggregation slot."
    0x149 AGG_MAX_TS agg_max_ts [AggSlot Slot Mask] None 0
    "Count live lanes into an aggregation slot."
    0x14A AGG_COUNT agg_count [AggSlot Mask] None 0
    "Feed lane hashes into a distinct-count sketch slot."
    0x14B AGG_APPROX_COUNT agg_approx_count [AggSlot Slot Mask] None 0
    "Bitwise-AND fold into an aggregation slot."
    0x14C AGG_AND_I agg_and_i [AggSlot Slot Mask] None 0
    "Bitwise-OR fold into an aggregation slot."
    0x14D AGG_OR_I agg_or_i [AggSlot Slot Mask] None 0
    "Bitwise-XOR fold into an aggregation slot."
    0x14E AGG_XOR_I agg_xor_i [AggSlot Slot Mask] None 0
    "Boolean-AND fold of a mask into an aggregation slot."
    0x14F AGG_AND_BOOL agg_and_bool [AggSlot Mask Mask] None 0
    "Boolean-OR fold of a mask into an aggregation slot."
    0x150 AGG_OR_BOOL agg_or_bool [AggSlot Mask Mask] None 0

    // -- grouped aggregation ------------------------------------------------
    "Compensated float sum into per-group slots."
    0x160 AGG_SLOT_SUM_F agg_slot_sum_f [AggSlot LaneOff Slot Mask] None 0
    "Integer sum into per-group slots."
    0x161 AGG_SLOT_SUM_I agg_slot_sum_i [AggSlot LaneOff Slot Mask] None 0
    "Compensated float average into per-group slots."
    0x162 AGG_SLOT_AVG_F agg_slot_avg_f [AggSlot LaneOff Slot Mask] None 0
    "Integer average into per-group slots."
    0x163 AGG_SLOT_AVG_I agg_slot_avg_i [AggSlot LaneOff Slot Mask] None 0
    "Float minimum into per-group slots."
    0x164 AGG_SLOT_MIN_F agg_slot_min_f [AggSlot LaneOff Slot Mask] None 0
    "Float maximum into per-group slots."
    0x165 AGG_SLOT_MAX_F agg_slot_max_f [AggSlot LaneOff Slot Mask] None 0
    "Integer minimum into per-group slots."
    0x166 AGG_SLOT_MIN_I agg_slot_min_i [AggSlot LaneOff Slot Mask] None 0
    "Integer maximum into per-group slots."
    0x167 AGG_SLOT_MAX_I agg_slot_max_i [AggSlot LaneOff Slot Mask] None 0
    "Count live lanes into per-group slots."
    0x168 AGG_SLOT_COUNT agg_slot_count [AggSlot LaneOff Mask] None 0

    // -- auxiliary bindings -------------------------------------------------
    "Copy a value register and its mask into an auxiliary output."
    0x170 STORE_AUX store_aux [AuxSlot Slot Mask] None 0
    "Load an auxiliary input as a value register and mask."
    0x171 LOAD_AUX load_aux [AuxSlot] ValueMask 0
}

impl Op {
    /// Total encoded length: opcode, destination slots, operands.
    pub const fn encoded_len(self) -> usize {
        let mut n = 2 + self.out().width();
        let args = self.args();
        let mut i = 0;
        while i < args.len() {
            n += args[i].width();
            i += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn u16_round_trip_every_op() {
        for op in Op::iter() {
            let raw: u16 = op.into();
            assert_eq!(Op::try_from(raw), Ok(op));
        }
        assert_eq!(Op::try_from(0xffff), Err(InvalidOpcode));
    }

    #[test]
    fn encoded_len_covers_header() {
        for op in Op::iter() {
            assert!(op.encoded_len() >= 2, "{op:?}");
            assert_eq!(op.encoded_len() % 2, 0, "{op:?}");
        }
    }

    #[test]
    fn sinks_have_no_outputs() {
        for op in [Op::RET, Op::RET_K, Op::RET_V, Op::ABORT, Op::AGG_SUM_F, Op::STORE_AUX] {
            assert_eq!(op.out(), crate::OutKind::None);
        }
    }

    #[test]
    fn scratch_reservations_are_lane_multiples() {
        for op in Op::iter() {
            assert_eq!(op.scratch() % 16, 0, "{op:?}");
        }
    }

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for op in Op::iter() {
            assert!(seen.insert(op.mnemonic()), "duplicate {}", op.mnemonic());
        }
    }
}
