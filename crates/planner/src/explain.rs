use crate::ir::{ExprKind, IrGraph, OperatorKind};
use qv_common::NodeId;

/// Render an IR graph as deterministic multiline text: operators in
/// topological order with parents, relations, and payload expressions.
pub fn explain_graph(graph: &IrGraph) -> String {
    let mut out = String::new();
    for id in graph.dag().topological_sort() {
        let op = graph.operator(id);
        let parents = graph
            .parents_of(id)
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("[{id}] {}(parents=[{parents}])", op.kind.name()));
        if let Some(relation) = op.relation() {
            out.push_str(&format!(" relation={}", relation.debug_string()));
        }
        out.push('\n');
        match &op.kind {
            OperatorKind::MemorySource {
                table,
                column_names,
                time_start_ns,
                time_stop_ns,
                ..
            } => {
                out.push_str(&format!("  table={table} columns={column_names:?}\n"));
                if time_start_ns.is_some() || time_stop_ns.is_some() {
                    out.push_str(&format!(
                        "  time=[{time_start_ns:?}, {time_stop_ns:?})\n"
                    ));
                }
            }
            OperatorKind::MemorySink { name } => {
                out.push_str(&format!("  name={name}\n"));
            }
            OperatorKind::Map {
                exprs,
                keep_input_columns,
            } => {
                out.push_str(&format!("  keep_input_columns={keep_input_columns}\n"));
                for ce in exprs {
                    out.push_str(&format!("  {} := {}\n", ce.name, fmt_expr(graph, ce.expr)));
                }
            }
            OperatorKind::Filter { predicate } => {
                out.push_str(&format!("  predicate={}\n", fmt_expr(graph, *predicate)));
            }
            OperatorKind::Limit { n } => {
                out.push_str(&format!("  n={n}\n"));
            }
            OperatorKind::BlockingAgg { groups, aggregates } => {
                let keys = groups
                    .iter()
                    .map(|&g| fmt_expr(graph, g))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("  groups=[{keys}]\n"));
                for ce in aggregates {
                    out.push_str(&format!("  {} := {}\n", ce.name, fmt_expr(graph, ce.expr)));
                }
            }
            OperatorKind::GroupBy { groups } => {
                let keys = groups
                    .iter()
                    .map(|&g| fmt_expr(graph, g))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("  groups=[{keys}]\n"));
            }
            OperatorKind::Join {
                how,
                left_on,
                right_on,
                suffixes,
                ..
            } => {
                let left = left_on
                    .iter()
                    .map(|&e| fmt_expr(graph, e))
                    .collect::<Vec<_>>()
                    .join(", ");
                let right = right_on
                    .iter()
                    .map(|&e| fmt_expr(graph, e))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!(
                    "  how={how:?} on=[{left}]=[{right}] suffixes=('{}', '{}')\n",
                    suffixes.0, suffixes.1
                ));
            }
            OperatorKind::Union { .. } => {}
            OperatorKind::Rolling {
                window_col,
                window_size_ns,
                ..
            } => {
                out.push_str(&format!(
                    "  window_col={window_col} window_size_ns={window_size_ns:?}\n"
                ));
            }
            OperatorKind::Drop { columns } => {
                out.push_str(&format!("  columns={columns:?}\n"));
            }
            OperatorKind::UdtfSource { spec, .. } => {
                out.push_str(&format!("  udtf={} executor={:?}\n", spec.name, spec.executor));
            }
        }
    }
    out
}

fn fmt_expr(graph: &IrGraph, id: NodeId) -> String {
    let expr = graph.expr(id);
    match &expr.kind {
        ExprKind::Column { name, parent_idx } => format!("{name}@{parent_idx}"),
        ExprKind::Literal(v) => v.to_string(),
        ExprKind::Func { name, args, .. } => {
            let inner = args
                .iter()
                .map(|&a| fmt_expr(graph, a))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{name}({inner})")
        }
        ExprKind::Metadata { name, .. } => format!("metadata({name})"),
        ExprKind::Tuple { items } => {
            let inner = items
                .iter()
                .map(|&i| fmt_expr(graph, i))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({inner})")
        }
    }
}
