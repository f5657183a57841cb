//! The engine façade: parameterized query construction and execution.

use std::sync::Arc;

use crate::agg::AggValue;
use crate::error::VmResult;
use crate::expr::{AggSpec, Expr};
use crate::pipeline::{
    Aggregate, CancelToken, Collector, Count, Cross, Filter, GroupAggregate, GroupRow, Order,
    OrderSpec, Project, QuerySink, Table,
};

/// Engine-wide execution parameters.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Worker threads per query.
    pub parallelism: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl EngineParams {
    /// Override the worker count.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }
}

/// Query construction and execution entry point.
#[derive(Debug, Default)]
pub struct Engine {
    params: EngineParams,
}

impl Engine {
    /// Engine with explicit parameters.
    pub fn new(params: EngineParams) -> Self {
        Self { params }
    }

    /// Push a table through an operator chain.
    pub fn run(&self, table: &dyn Table, sink: &dyn QuerySink) -> VmResult<()> {
        let cancel = CancelToken::new();
        self.run_with_cancel(table, sink, &cancel)
    }

    /// Push a table through an operator chain under a cancellation token.
    pub fn run_with_cancel(
        &self,
        table: &dyn Table,
        sink: &dyn QuerySink,
        cancel: &CancelToken,
    ) -> VmResult<()> {
        tracing::debug!(parallelism = self.params.parallelism, "query start");
        table.write_chunks(sink, self.params.parallelism, cancel)
    }

    /// `SELECT COUNT(*) [WHERE predicate]`.
    pub fn count(&self, table: &dyn Table, predicate: Option<&Expr>) -> VmResult<u64> {
        let sink = Count::new(predicate)?;
        self.run(table, &sink)?;
        Ok(sink.value())
    }

    /// `SELECT * WHERE predicate`, collected.
    pub fn filter_collect(&self, table: &dyn Table, predicate: &Expr) -> VmResult<Collector> {
        let collector = Arc::new(Collector::new());
        let sink = Filter::new(predicate, collector.clone() as Arc<dyn QuerySink>)?;
        self.run(table, &sink)?;
        Ok(Arc::try_unwrap(collector).unwrap_or_else(|arc| Collector::copy_of(&arc)))
    }

    /// `SELECT label: expr, ...`, collected.
    pub fn project_collect(
        &self,
        table: &dyn Table,
        bindings: &[(String, Expr)],
    ) -> VmResult<Collector> {
        let collector = Arc::new(Collector::new());
        let sink = Project::new(bindings, collector.clone() as Arc<dyn QuerySink>)?;
        self.run(table, &sink)?;
        Ok(Arc::try_unwrap(collector).unwrap_or_else(|arc| Collector::copy_of(&arc)))
    }

    /// Scalar aggregation.
    pub fn aggregate(
        &self,
        table: &dyn Table,
        specs: Vec<AggSpec>,
    ) -> VmResult<Vec<(String, AggValue)>> {
        let sink = Aggregate::new(specs)?;
        self.run(table, &sink)?;
        sink.results()
    }

    /// Grouped aggregation.
    pub fn group_aggregate(
        &self,
        table: &dyn Table,
        group_by: Vec<Expr>,
        specs: Vec<AggSpec>,
    ) -> VmResult<Vec<GroupRow>> {
        let sink = GroupAggregate::new(group_by, specs)?;
        self.run(table, &sink)?;
        sink.results()
    }

    /// `ORDER BY ... [LIMIT n OFFSET m]`, collected in output order.
    pub fn order_collect(&self, table: &dyn Table, spec: OrderSpec) -> VmResult<Collector> {
        let collector = Arc::new(Collector::new());
        let sink = Order::new(spec, collector.clone() as Arc<dyn QuerySink>)?;
        self.run(table, &sink)?;
        Ok(Arc::try_unwrap(collector).unwrap_or_else(|arc| Collector::copy_of(&arc)))
    }

    /// Cross join against a buffered right side, then a filter, counted.
    pub fn cross_filter_count(
        &self,
        left: &dyn Table,
        right: &[crate::pipeline::Chunk],
        predicate: &Expr,
    ) -> VmResult<u64> {
        let count = Arc::new(Count::new(Some(predicate))?);
        let sink = Cross::new(right, count.clone() as Arc<dyn QuerySink>)?;
        self.run(left, &sink)?;
        Ok(count.value())
    }
}
