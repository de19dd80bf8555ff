//! Serde wire forms for compiled plans.
//!
//! A [`PlanFragment`] is the per-execution-node output of compilation:
//! operator nodes in topological order with resolved relations and inlined
//! expression trees, plus the operator dependency DAG with sorted id lists.

use qv_common::NodeId;
use serde::{Deserialize, Serialize};

use crate::dag::DagProto;
use crate::ir::{ExprKind, IrGraph, JoinKind, JoinOutputColumn, OperatorKind, UdtfExecutor};
use crate::relation::Relation;
use crate::types::{DataType, LiteralValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprProto {
    Column {
        name: String,
        parent_op_index: usize,
        /// Position within the referenced parent's relation, resolved at
        /// serialization time.
        column_index: Option<usize>,
    },
    Literal(LiteralValue),
    Func {
        name: String,
        args: Vec<ExprProto>,
        arg_types: Vec<DataType>,
        return_type: Option<DataType>,
    },
    Tuple {
        items: Vec<ExprProto>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExprProto {
    pub name: String,
    pub expr: ExprProto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorProto {
    MemorySource {
        table: String,
        column_names: Vec<String>,
        time_start_ns: Option<i64>,
        time_stop_ns: Option<i64>,
    },
    MemorySink {
        name: String,
    },
    Map {
        exprs: Vec<NamedExprProto>,
        keep_input_columns: bool,
    },
    Filter {
        predicate: ExprProto,
    },
    Limit {
        n: i64,
    },
    BlockingAgg {
        groups: Vec<ExprProto>,
        aggregates: Vec<NamedExprProto>,
    },
    Join {
        how: JoinKind,
        left_on: Vec<ExprProto>,
        right_on: Vec<ExprProto>,
        output_columns: Vec<JoinOutputColumn>,
    },
    Union {
        column_mappings: Vec<Vec<usize>>,
    },
    Rolling {
        window_col: String,
        window_size_ns: Option<i64>,
        groups: Vec<ExprProto>,
    },
    Drop {
        columns: Vec<String>,
    },
    UdtfSource {
        name: String,
        executor: UdtfExecutor,
        arg_values: Vec<ExprProto>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNodeProto {
    pub id: NodeId,
    pub op: OperatorProto,
    pub relation: Relation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub dag: DagProto,
    pub nodes: Vec<PlanNodeProto>,
}

impl PlanFragment {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn expr_proto(graph: &IrGraph, parents: &[NodeId], id: NodeId) -> ExprProto {
    let expr = graph.expr(id);
    match &expr.kind {
        ExprKind::Column { name, parent_idx } => {
            let column_index = parents.get(*parent_idx).and_then(|&parent| {
                graph
                    .operator(parent)
                    .relation()
                    .and_then(|r| r.column_index(name))
            });
            ExprProto::Column {
                name: name.clone(),
                parent_op_index: *parent_idx,
                column_index,
            }
        }
        ExprKind::Literal(v) => ExprProto::Literal(v.clone()),
        ExprKind::Func {
            name,
            args,
            arg_types,
        } => ExprProto::Func {
            name: name.clone(),
            args: args
                .iter()
                .map(|&a| expr_proto(graph, parents, a))
                .collect(),
            arg_types: arg_types.clone(),
            return_type: expr.data_type,
        },
        ExprKind::Metadata { name, .. } => {
            // Metadata references are rewritten into function calls during
            // compilation; one surviving here is a compiler bug.
            panic!("unconverted metadata reference '{name}' at serialization")
        }
        ExprKind::Tuple { items } => ExprProto::Tuple {
            items: items
                .iter()
                .map(|&i| expr_proto(graph, parents, i))
                .collect(),
        },
    }
}

fn named(graph: &IrGraph, parents: &[NodeId], name: &str, expr: NodeId) -> NamedExprProto {
    NamedExprProto {
        name: name.to_string(),
        expr: expr_proto(graph, parents, expr),
    }
}

fn operator_proto(graph: &IrGraph, id: NodeId) -> OperatorProto {
    let parents = graph.parents_of(id).to_vec();
    let op = graph.operator(id);
    match &op.kind {
        OperatorKind::MemorySource {
            table,
            column_names,
            time_start_ns,
            time_stop_ns,
            ..
        } => OperatorProto::MemorySource {
            table: table.clone(),
            column_names: column_names.clone(),
            time_start_ns: *time_start_ns,
            time_stop_ns: *time_stop_ns,
        },
        OperatorKind::MemorySink { name } => OperatorProto::MemorySink { name: name.clone() },
        OperatorKind::Map {
            exprs,
            keep_input_columns,
        } => OperatorProto::Map {
            exprs: exprs
                .iter()
                .map(|ce| named(graph, &parents, &ce.name, ce.expr))
                .collect(),
            keep_input_columns: *keep_input_columns,
        },
        OperatorKind::Filter { predicate } => OperatorProto::Filter {
            predicate: expr_proto(graph, &parents, *predicate),
        },
        OperatorKind::Limit { n } => OperatorProto::Limit { n: *n },
        OperatorKind::BlockingAgg { groups, aggregates } => OperatorProto::BlockingAgg {
            groups: groups
                .iter()
                .map(|&g| expr_proto(graph, &parents, g))
                .collect(),
            aggregates: aggregates
                .iter()
                .map(|ce| named(graph, &parents, &ce.name, ce.expr))
                .collect(),
        },
        OperatorKind::GroupBy { .. } => {
            panic!("groupby must be merged away before serialization")
        }
        OperatorKind::Join {
            how,
            left_on,
            right_on,
            output_columns,
            ..
        } => OperatorProto::Join {
            how: *how,
            left_on: left_on
                .iter()
                .map(|&e| expr_proto(graph, &parents, e))
                .collect(),
            right_on: right_on
                .iter()
                .map(|&e| expr_proto(graph, &parents, e))
                .collect(),
            output_columns: output_columns.clone(),
        },
        OperatorKind::Union { column_mappings } => OperatorProto::Union {
            column_mappings: column_mappings.clone(),
        },
        OperatorKind::Rolling {
            window_col,
            window_size_ns,
            groups,
            ..
        } => OperatorProto::Rolling {
            window_col: window_col.clone(),
            window_size_ns: *window_size_ns,
            groups: groups
                .iter()
                .map(|&g| expr_proto(graph, &parents, g))
                .collect(),
        },
        OperatorKind::Drop { columns } => OperatorProto::Drop {
            columns: columns.clone(),
        },
        OperatorKind::UdtfSource { spec, arg_values } => OperatorProto::UdtfSource {
            name: spec.name.clone(),
            executor: spec.executor,
            arg_values: arg_values
                .iter()
                .map(|&a| expr_proto(graph, &parents, a))
                .collect(),
        },
    }
}

/// Serialize a compiled graph: nodes in topological order, DAG with sorted
/// adjacency lists.
pub fn plan_fragment(graph: &IrGraph) -> PlanFragment {
    let mut nodes = Vec::new();
    for id in graph.dag().topological_sort() {
        nodes.push(PlanNodeProto {
            id,
            op: operator_proto(graph, id),
            relation: graph
                .operator(id)
                .relation()
                .cloned()
                .unwrap_or_default(),
        });
    }
    PlanFragment {
        dag: graph.dag().to_proto(),
        nodes,
    }
}
