use std::cell::RefCell;
use std::rc::Rc;

use qv_common::{compile_err, NodeId, Result, SourceSpan};
use qv_planner::{
    ColumnExpr, ExprKind, IrGraph, JoinKind, OperatorKind, UdtfSpec,
};

use crate::expr::ExprDef;

type SharedGraph = Rc<RefCell<IrGraph>>;

/// Builder root owning the IR graph under construction.
///
/// One query builds one graph; hand the finished graph to the planner's
/// `Compiler`.
#[derive(Debug, Default)]
pub struct Query {
    graph: SharedGraph,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// `q.table("cpu")` -> MemorySource over every catalog column.
    pub fn table(&self, table: &str) -> Result<DataFrame> {
        self.table_range(table, &[], None, None)
    }

    /// MemorySource with an explicit column subset and optional start/stop
    /// time expressions.
    pub fn table_range(
        &self,
        table: &str,
        columns: &[&str],
        start_time: Option<ExprDef>,
        stop_time: Option<ExprDef>,
    ) -> Result<DataFrame> {
        let span = SourceSpan::UNKNOWN;
        let mut graph = self.graph.borrow_mut();
        let time_start = start_time.map(|e| lower_expr(&mut graph, span, &e));
        let time_stop = stop_time.map(|e| lower_expr(&mut graph, span, &e));
        let op = graph.add_operator(
            span,
            OperatorKind::MemorySource {
                table: table.to_string(),
                column_names: columns.iter().map(|c| c.to_string()).collect(),
                time_start,
                time_stop,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )?;
        drop(graph);
        Ok(self.frame(op, span))
    }

    /// Table-valued function source with literal arguments.
    pub fn udtf(&self, spec: UdtfSpec, args: Vec<ExprDef>) -> Result<DataFrame> {
        let span = SourceSpan::UNKNOWN;
        let mut graph = self.graph.borrow_mut();
        let arg_values: Vec<NodeId> = args
            .iter()
            .map(|e| lower_expr(&mut graph, span, e))
            .collect();
        let op = graph.add_operator(span, OperatorKind::UdtfSource { spec, arg_values }, &[])?;
        drop(graph);
        Ok(self.frame(op, span))
    }

    /// Take the finished graph out of the builder.
    ///
    /// Panics when DataFrame handles are still alive.
    pub fn into_graph(self) -> IrGraph {
        Rc::try_unwrap(self.graph)
            .expect("dataframe handles still alive")
            .into_inner()
    }

    fn frame(&self, op: NodeId, span: SourceSpan) -> DataFrame {
        DataFrame {
            graph: Rc::clone(&self.graph),
            op,
            span,
        }
    }
}

/// Handle to one operator in the graph under construction; every method
/// appends an operator and returns the new handle.
#[derive(Debug, Clone)]
pub struct DataFrame {
    graph: SharedGraph,
    op: NodeId,
    span: SourceSpan,
}

/// Lower a builder expression into IR nodes, returning the root id.
pub(crate) fn lower_expr(graph: &mut IrGraph, span: SourceSpan, e: &ExprDef) -> NodeId {
    match e {
        ExprDef::Col(name) => graph.add_expr(
            span,
            ExprKind::Column {
                name: name.clone(),
                parent_idx: 0,
            },
        ),
        ExprDef::ColOf(parent_idx, name) => graph.add_expr(
            span,
            ExprKind::Column {
                name: name.clone(),
                parent_idx: *parent_idx,
            },
        ),
        ExprDef::Lit(value) => graph.add_expr(span, ExprKind::Literal(value.clone())),
        ExprDef::Func { name, args } => {
            let lowered: Vec<NodeId> = args
                .iter()
                .map(|a| lower_expr(graph, span, a))
                .collect();
            graph.add_expr(
                span,
                ExprKind::Func {
                    name: name.clone(),
                    args: lowered,
                    arg_types: vec![],
                },
            )
        }
        ExprDef::Metadata(name) => graph.add_expr(
            span,
            ExprKind::Metadata {
                name: name.clone(),
                property: None,
            },
        ),
        ExprDef::Tuple(items) => {
            let lowered: Vec<NodeId> = items
                .iter()
                .map(|i| lower_expr(graph, span, i))
                .collect();
            graph.add_expr(span, ExprKind::Tuple { items: lowered })
        }
    }
}

impl DataFrame {
    pub fn op_id(&self) -> NodeId {
        self.op
    }

    /// Attach a source position to operators built from this handle.
    pub fn at(mut self, span: SourceSpan) -> Self {
        self.span = span;
        self
    }

    /// `df.map([("x", expr), ...], keep_input)` -> Map.
    pub fn map(&self, exprs: Vec<(&str, ExprDef)>, keep_input_columns: bool) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let lowered: Vec<ColumnExpr> = exprs
            .iter()
            .map(|(name, e)| ColumnExpr {
                name: name.to_string(),
                expr: lower_expr(&mut graph, self.span, e),
            })
            .collect();
        let op = graph.add_operator(
            self.span,
            OperatorKind::Map {
                exprs: lowered,
                keep_input_columns,
            },
            &[self.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    /// Sequential-assignment sugar: `df.assign("x", expr)` adds one column
    /// on top of the input columns.
    pub fn assign(&self, name: &str, expr: ExprDef) -> Result<DataFrame> {
        self.map(vec![(name, expr)], true)
    }

    pub fn filter(&self, predicate: ExprDef) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let lowered = lower_expr(&mut graph, self.span, &predicate);
        let op = graph.add_operator(
            self.span,
            OperatorKind::Filter { predicate: lowered },
            &[self.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    pub fn head(&self, n: i64) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let op = graph.add_operator(self.span, OperatorKind::Limit { n }, &[self.op])?;
        drop(graph);
        Ok(self.child(op))
    }

    pub fn groupby(&self, keys: &[&str]) -> Result<GroupedDataFrame> {
        let mut graph = self.graph.borrow_mut();
        let groups: Vec<NodeId> = keys
            .iter()
            .map(|k| lower_expr(&mut graph, self.span, &ExprDef::Col(k.to_string())))
            .collect();
        let op = graph.add_operator(self.span, OperatorKind::GroupBy { groups }, &[self.op])?;
        drop(graph);
        Ok(GroupedDataFrame {
            frame: self.child(op),
        })
    }

    /// `df.merge(right, how, ["key"], ["key"], ("_x", "_y"))` -> Join.
    pub fn merge(
        &self,
        right: &DataFrame,
        how: JoinKind,
        left_on: &[&str],
        right_on: &[&str],
        suffixes: (&str, &str),
    ) -> Result<DataFrame> {
        if !Rc::ptr_eq(&self.graph, &right.graph) {
            return compile_err(
                self.span,
                "cannot join DataFrames from different Query instances",
            );
        }
        let mut graph = self.graph.borrow_mut();
        let left_cols: Vec<NodeId> = left_on
            .iter()
            .map(|c| lower_expr(&mut graph, self.span, &ExprDef::ColOf(0, c.to_string())))
            .collect();
        let right_cols: Vec<NodeId> = right_on
            .iter()
            .map(|c| lower_expr(&mut graph, self.span, &ExprDef::ColOf(1, c.to_string())))
            .collect();
        let op = graph.add_operator(
            self.span,
            OperatorKind::Join {
                how,
                specified_right: false,
                left_on: left_cols,
                right_on: right_cols,
                suffixes: (suffixes.0.to_string(), suffixes.1.to_string()),
                output_columns: vec![],
            },
            &[self.op, right.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    /// `df.append([dfs...])` -> Union; relations unify to this frame's
    /// column order.
    pub fn append(&self, others: &[&DataFrame]) -> Result<DataFrame> {
        for other in others {
            if !Rc::ptr_eq(&self.graph, &other.graph) {
                return compile_err(
                    self.span,
                    "cannot union DataFrames from different Query instances",
                );
            }
        }
        let mut parents = vec![self.op];
        parents.extend(others.iter().map(|o| o.op));
        let mut graph = self.graph.borrow_mut();
        let op = graph.add_operator(
            self.span,
            OperatorKind::Union {
                column_mappings: vec![],
            },
            &parents,
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    /// Rolling window over `window_col`, window width given as a duration
    /// expression (`lit("10s")` or integer nanoseconds).
    pub fn rolling(&self, window: ExprDef, window_col: &str) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let window_size = lower_expr(&mut graph, self.span, &window);
        let op = graph.add_operator(
            self.span,
            OperatorKind::Rolling {
                window_col: window_col.to_string(),
                window_size,
                window_size_ns: None,
                groups: vec![],
            },
            &[self.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    pub fn drop_columns(&self, columns: &[&str]) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let op = graph.add_operator(
            self.span,
            OperatorKind::Drop {
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
            &[self.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    /// Terminal sink; duplicate names are de-duplicated at compile time.
    pub fn display(&self, name: &str) -> Result<DataFrame> {
        let mut graph = self.graph.borrow_mut();
        let op = graph.add_operator(
            self.span,
            OperatorKind::MemorySink {
                name: name.to_string(),
            },
            &[self.op],
        )?;
        drop(graph);
        Ok(self.child(op))
    }

    fn child(&self, op: NodeId) -> DataFrame {
        DataFrame {
            graph: Rc::clone(&self.graph),
            op,
            span: self.span,
        }
    }
}

/// `df.groupby(keys)` result; finish with `.agg(...)`.
#[derive(Debug, Clone)]
pub struct GroupedDataFrame {
    frame: DataFrame,
}

impl GroupedDataFrame {
    /// `grouped.agg([("total", "sum", col("v"))])` -> BlockingAgg. The
    /// grouping keys are merged in by the planner.
    pub fn agg(&self, aggs: Vec<(&str, &str, ExprDef)>) -> Result<DataFrame> {
        let mut graph = self.frame.graph.borrow_mut();
        let aggregates: Vec<ColumnExpr> = aggs
            .iter()
            .map(|(name, func_name, arg)| {
                let lowered_arg = lower_expr(&mut graph, self.frame.span, arg);
                let expr = graph.add_expr(
                    self.frame.span,
                    ExprKind::Func {
                        name: func_name.to_string(),
                        args: vec![lowered_arg],
                        arg_types: vec![],
                    },
                );
                ColumnExpr {
                    name: name.to_string(),
                    expr,
                }
            })
            .collect();
        let op = graph.add_operator(
            self.frame.span,
            OperatorKind::BlockingAgg {
                groups: vec![],
                aggregates,
            },
            &[self.frame.op],
        )?;
        drop(graph);
        Ok(self.frame.child(op))
    }
}
