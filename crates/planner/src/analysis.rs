//! Resolution rules: data types, relations, compile-time expressions,
//! metadata conversion.
//!
//! Every rule here is idempotent at fixed point and borrows the immutable
//! [`CompilerState`] for the duration of one compilation.

use std::collections::BTreeSet;

use qv_common::{compile_err, NodeId, Result};

use crate::ir::{ColumnExpr, ExprKind, IrGraph, JoinOutputColumn, OperatorKind};
use crate::metadata::METADATA_COLUMN_PREFIX;
use crate::relation::{Column, CompatibilityCheck, Relation};
use crate::rules::Rule;
use crate::state::CompilerState;
use crate::types::{parse_duration_ns, DataType, LiteralValue};

/// `(parent operand index, column name)` pairs referenced by the expression
/// closure under `roots`.
pub(crate) fn referenced_columns(graph: &IrGraph, roots: &[NodeId]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for id in graph.expr_closure(roots) {
        if let Some(expr) = graph.maybe_expr(id) {
            if let ExprKind::Column { name, parent_idx } = &expr.kind {
                out.push((*parent_idx, name.clone()));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// DataTypeRule
// ---------------------------------------------------------------------------

/// Resolves expression data types bottom-up.
///
/// A function call resolves by (name, argument type tuple) registry lookup
/// once every argument is resolved; a missing signature is a compile error
/// naming the function. Nameless function calls (compiler-internal markers)
/// are skipped. Column references resolve against the containing operator's
/// parent relation, which enforces source-to-sink resolution order.
pub struct DataTypeRule<'a> {
    pub state: &'a CompilerState,
}

impl<'a> Rule for DataTypeRule<'a> {
    fn name(&self) -> &'static str {
        "DataTypeRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(expr) = graph.maybe_expr(node) else {
            return Ok(false);
        };
        if expr.is_resolved() {
            return Ok(false);
        }
        match expr.kind.clone() {
            ExprKind::Column { name, parent_idx } => {
                self.resolve_column(graph, node, &name, parent_idx)
            }
            ExprKind::Func { name, args, .. } => {
                if name.is_empty() {
                    return Ok(false);
                }
                self.resolve_func(graph, node, &name, &args)
            }
            ExprKind::Metadata { property, .. } => {
                let Some(property) = property else {
                    return Ok(false);
                };
                graph.expr_mut(node).data_type = Some(property.data_type);
                Ok(true)
            }
            // Literals resolve at construction; tuples carry no single type.
            ExprKind::Literal(_) | ExprKind::Tuple { .. } => Ok(false),
        }
    }
}

impl<'a> DataTypeRule<'a> {
    fn resolve_column(
        &self,
        graph: &mut IrGraph,
        node: NodeId,
        name: &str,
        parent_idx: usize,
    ) -> Result<bool> {
        let span = graph.expr(node).span;
        let Some(container) = graph.containing_op(node) else {
            // Stray expression; the cleanup rule will collect it.
            return Ok(false);
        };
        let parents = graph.parents_of(container);
        if parent_idx >= parents.len() {
            let op = graph.operator(container);
            return compile_err(
                span,
                format!(
                    "No parent for operator {}(id={}). Can't resolve column '{name}'.",
                    op.kind.name(),
                    op.id
                ),
            );
        }
        let parent = parents[parent_idx];
        let parent_op = graph.operator(parent);
        let Some(relation) = parent_op.relation() else {
            // The parent has yet to propagate its relation.
            return Ok(false);
        };
        let Some(data_type) = relation.column_type(name) else {
            return compile_err(
                span,
                format!(
                    "Column '{name}' not found in relation of {}(id={})",
                    parent_op.kind.name(),
                    parent_op.id
                ),
            );
        };
        graph.expr_mut(node).data_type = Some(data_type);
        Ok(true)
    }

    fn resolve_func(
        &self,
        graph: &mut IrGraph,
        node: NodeId,
        name: &str,
        args: &[NodeId],
    ) -> Result<bool> {
        let span = graph.expr(node).span;
        let mut arg_types = Vec::with_capacity(args.len());
        for &arg in args {
            match graph.expr(arg).data_type {
                Some(t) => arg_types.push(t),
                None => return Ok(false),
            }
        }
        let is_aggregate_root = graph.containing_op(node).is_some_and(|op| {
            matches!(
                &graph.operator(op).kind,
                OperatorKind::BlockingAgg { aggregates, .. }
                    if aggregates.iter().any(|ce| ce.expr == node)
            )
        });
        let resolved = if is_aggregate_root {
            self.state.registry().aggregate_return_type(name, &arg_types)
        } else {
            self.state.registry().scalar_return_type(name, &arg_types)
        };
        let Some(return_type) = resolved else {
            let types = arg_types
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",");
            return compile_err(
                span,
                format!("Could not find function '{name}' with arguments [{types}]."),
            );
        };
        let expr = graph.expr_mut(node);
        if let ExprKind::Func {
            arg_types: slot, ..
        } = &mut expr.kind
        {
            *slot = arg_types;
        }
        expr.data_type = Some(return_type);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// SourceRelationRule
// ---------------------------------------------------------------------------

/// Resolves source relations: memory sources from the catalog (honoring an
/// explicit column subset), UDTF sources from their declared spec.
pub struct SourceRelationRule<'a> {
    pub state: &'a CompilerState,
}

impl<'a> Rule for SourceRelationRule<'a> {
    fn name(&self) -> &'static str {
        "SourceRelationRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        if op.is_relation_set() {
            return Ok(false);
        }
        let span = op.span;
        match &op.kind {
            OperatorKind::MemorySource {
                table,
                column_names,
                ..
            } => {
                let table = table.clone();
                let column_names = column_names.clone();
                let Some(table_relation) = self.state.table_relation(&table) else {
                    return compile_err(span, format!("Table '{table}' not found."));
                };
                let relation = if column_names.is_empty() {
                    table_relation.clone()
                } else {
                    let mut missing: BTreeSet<String> = BTreeSet::new();
                    let mut selected = Relation::new();
                    for name in &column_names {
                        match table_relation.column_index(name) {
                            Some(idx) => {
                                if selected.has_column(name) {
                                    return compile_err(
                                        span,
                                        format!("Duplicate column '{name}' in select list."),
                                    );
                                }
                                selected.add_column(table_relation.column(idx).clone());
                            }
                            None => {
                                missing.insert(name.clone());
                            }
                        }
                    }
                    if !missing.is_empty() {
                        let joined = missing.into_iter().collect::<Vec<_>>().join(",");
                        return compile_err(
                            span,
                            format!("Columns {{{joined}}} are missing in table '{table}'."),
                        );
                    }
                    selected
                };
                graph.set_relation(node, relation);
                Ok(true)
            }
            OperatorKind::UdtfSource { spec, .. } => {
                let relation = spec.relation.clone();
                graph.set_relation(node, relation);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// ConvertStringTimesRule
// ---------------------------------------------------------------------------

/// Resolves memory-source start/stop times and rolling window sizes into
/// absolute nanosecond integers.
///
/// Time strings (`-30s`) are interpreted relative to the compiler's "now";
/// already-integer expressions pass through; add/subtract/multiply trees over
/// foldable leaves are folded.
pub struct ConvertStringTimesRule<'a> {
    pub state: &'a CompilerState,
}

impl<'a> ConvertStringTimesRule<'a> {
    fn eval_time_value(&self, graph: &IrGraph, node: NodeId, relative: bool) -> Result<i64> {
        let expr = graph.expr(node);
        match &expr.kind {
            ExprKind::Literal(LiteralValue::String(s)) => match parse_duration_ns(s) {
                Some(d) if relative => Ok(self.state.time_now_ns() + d),
                Some(d) => Ok(d),
                None => compile_err(
                    expr.span,
                    format!("Unable to parse '{s}' as a relative time."),
                ),
            },
            ExprKind::Literal(LiteralValue::Int64(v)) => Ok(*v),
            ExprKind::Literal(LiteralValue::Time64Ns(v)) => Ok(*v),
            ExprKind::Func { name, args, .. } if args.len() == 2 => {
                let a = self.eval_time_value(graph, args[0], relative)?;
                let b = self.eval_time_value(graph, args[1], relative)?;
                match name.as_str() {
                    "add" => Ok(a + b),
                    "subtract" => Ok(a - b),
                    "multiply" => Ok(a * b),
                    _ => compile_err(
                        expr.span,
                        format!("Only allowing [add, subtract, multiply], not '{name}'"),
                    ),
                }
            }
            other => compile_err(
                expr.span,
                format!(
                    "Expected integer, time expression, or a string representation of time, not {}",
                    other.name()
                ),
            ),
        }
    }
}

impl<'a> Rule for ConvertStringTimesRule<'a> {
    fn name(&self) -> &'static str {
        "ConvertStringTimesRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        match &op.kind {
            OperatorKind::MemorySource {
                time_start,
                time_stop,
                time_start_ns,
                time_stop_ns,
                ..
            } => {
                let mut resolved_start = None;
                let mut resolved_stop = None;
                if let (Some(expr), None) = (time_start, time_start_ns) {
                    resolved_start = Some(self.eval_time_value(graph, *expr, true)?);
                }
                if let (Some(expr), None) = (time_stop, time_stop_ns) {
                    resolved_stop = Some(self.eval_time_value(graph, *expr, true)?);
                }
                if resolved_start.is_none() && resolved_stop.is_none() {
                    return Ok(false);
                }
                if let OperatorKind::MemorySource {
                    time_start_ns,
                    time_stop_ns,
                    ..
                } = &mut graph.operator_mut(node).kind
                {
                    if resolved_start.is_some() {
                        *time_start_ns = resolved_start;
                    }
                    if resolved_stop.is_some() {
                        *time_stop_ns = resolved_stop;
                    }
                }
                Ok(true)
            }
            OperatorKind::Rolling {
                window_size,
                window_size_ns: None,
                ..
            } => {
                let span = op.span;
                // Window sizes are durations, not offsets from "now".
                let ns = self.eval_time_value(graph, *window_size, false)?;
                if ns <= 0 {
                    return compile_err(span, format!("Window size must be positive, got {ns}ns"));
                }
                if let OperatorKind::Rolling { window_size_ns, .. } =
                    &mut graph.operator_mut(node).kind
                {
                    *window_size_ns = Some(ns);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// CompileTimeExpressionRule
// ---------------------------------------------------------------------------

fn fold_binary(name: &str, a: &LiteralValue, b: &LiteralValue) -> Option<LiteralValue> {
    use LiteralValue::*;
    match (name, a, b) {
        ("add", Int64(x), Int64(y)) => Some(Int64(x + y)),
        ("subtract", Int64(x), Int64(y)) => Some(Int64(x - y)),
        ("multiply", Int64(x), Int64(y)) => Some(Int64(x * y)),
        ("add", Float64(x), Float64(y)) => Some(Float64(x + y)),
        ("subtract", Float64(x), Float64(y)) => Some(Float64(x - y)),
        ("multiply", Float64(x), Float64(y)) => Some(Float64(x * y)),
        ("add", Time64Ns(x), Int64(y)) => Some(Time64Ns(x + y)),
        ("add", Int64(x), Time64Ns(y)) => Some(Time64Ns(x + y)),
        ("subtract", Time64Ns(x), Int64(y)) => Some(Time64Ns(x - y)),
        ("subtract", Time64Ns(x), Time64Ns(y)) => Some(Int64(x - y)),
        _ => None,
    }
}

/// Folds add/subtract/multiply calls whose arguments are all literals into a
/// literal, in place (the node id survives; orphaned argument nodes are
/// reclaimed by the stray-node sweep).
///
/// Partial folding is expected: a mixed call keeps its shape while foldable
/// sub-expressions collapse underneath it on earlier passes.
pub struct CompileTimeExpressionRule;

impl Rule for CompileTimeExpressionRule {
    fn name(&self) -> &'static str {
        "CompileTimeExpressionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(expr) = graph.maybe_expr(node) else {
            return Ok(false);
        };
        let ExprKind::Func { name, args, .. } = &expr.kind else {
            return Ok(false);
        };
        if !matches!(name.as_str(), "add" | "subtract" | "multiply") || args.len() != 2 {
            return Ok(false);
        }
        let lhs = match &graph.expr(args[0]).kind {
            ExprKind::Literal(v) => v.clone(),
            _ => return Ok(false),
        };
        let rhs = match &graph.expr(args[1]).kind {
            ExprKind::Literal(v) => v.clone(),
            _ => return Ok(false),
        };
        let Some(folded) = fold_binary(name, &lhs, &rhs) else {
            return Ok(false);
        };
        let expr = graph.expr_mut(node);
        expr.data_type = Some(folded.data_type());
        expr.kind = ExprKind::Literal(folded);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// OperatorRelationRule
// ---------------------------------------------------------------------------

/// Propagates relations downstream per operator kind once every parent
/// relation (and every required expression type) is available.
pub struct OperatorRelationRule;

impl Rule for OperatorRelationRule {
    fn name(&self) -> &'static str {
        "OperatorRelationRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        if op.is_relation_set() || op.kind.is_source() {
            return Ok(false);
        }
        let parents = graph.parents_of(node).to_vec();
        if parents
            .iter()
            .any(|p| !graph.operator(*p).is_relation_set())
        {
            return Ok(false);
        }
        let kind = graph.operator(node).kind.clone();
        match kind {
            OperatorKind::Map {
                exprs,
                keep_input_columns,
            } => Self::set_map(graph, node, exprs, keep_input_columns, parents[0]),
            OperatorKind::BlockingAgg { groups, aggregates } => {
                Self::set_blocking_agg(graph, node, groups, aggregates)
            }
            OperatorKind::Union { .. } => Self::set_union(graph, node, &parents),
            OperatorKind::Join { .. } => Self::set_join(graph, node, &parents),
            OperatorKind::Drop { columns } => Self::set_drop(graph, node, columns, parents[0]),
            OperatorKind::Filter { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::GroupBy { .. }
            | OperatorKind::Rolling { .. }
            | OperatorKind::MemorySink { .. } => {
                let relation = graph.operator(parents[0]).relation().unwrap().clone();
                graph.set_relation(node, relation);
                Ok(true)
            }
            OperatorKind::MemorySource { .. } | OperatorKind::UdtfSource { .. } => Ok(false),
        }
    }
}

impl OperatorRelationRule {
    fn column_from_expr(graph: &IrGraph, ce: &ColumnExpr) -> Option<Column> {
        let expr = graph.expr(ce.expr);
        let data_type = expr.data_type?;
        let mut column = Column::new(ce.name.clone(), data_type);
        if let Some(semantic) = expr.annotation {
            column = column.with_semantic(semantic);
        }
        Some(column)
    }

    fn set_map(
        graph: &mut IrGraph,
        node: NodeId,
        exprs: Vec<ColumnExpr>,
        keep_input_columns: bool,
        parent: NodeId,
    ) -> Result<bool> {
        let span = graph.operator(node).span;
        let mut relation = Relation::new();
        if keep_input_columns {
            let expr_names: BTreeSet<&str> = exprs.iter().map(|ce| ce.name.as_str()).collect();
            let parent_relation = graph.operator(parent).relation().unwrap();
            for col in parent_relation.columns() {
                if !expr_names.contains(col.name.as_str()) {
                    relation.add_column(col.clone());
                }
            }
        }
        for ce in &exprs {
            let Some(column) = Self::column_from_expr(graph, ce) else {
                return Ok(false);
            };
            if relation.has_column(&column.name) {
                return compile_err(
                    span,
                    format!("duplicate output column '{}' in map", column.name),
                );
            }
            relation.add_column(column);
        }
        graph.set_relation(node, relation);
        Ok(true)
    }

    fn set_blocking_agg(
        graph: &mut IrGraph,
        node: NodeId,
        groups: Vec<NodeId>,
        aggregates: Vec<ColumnExpr>,
    ) -> Result<bool> {
        let span = graph.operator(node).span;
        let mut relation = Relation::new();
        for group in &groups {
            let expr = graph.expr(*group);
            let ExprKind::Column { name, .. } = &expr.kind else {
                return compile_err(span, "group keys must be column references");
            };
            let Some(data_type) = expr.data_type else {
                return Ok(false);
            };
            if relation.has_column(name) {
                return compile_err(span, format!("duplicate group key '{name}'"));
            }
            let mut column = Column::new(name.clone(), data_type);
            if let Some(semantic) = expr.annotation {
                column = column.with_semantic(semantic);
            }
            relation.add_column(column);
        }
        for ce in &aggregates {
            let Some(column) = Self::column_from_expr(graph, ce) else {
                return Ok(false);
            };
            if relation.has_column(&column.name) {
                return compile_err(
                    span,
                    format!("duplicate output column '{}' in agg", column.name),
                );
            }
            relation.add_column(column);
        }
        graph.set_relation(node, relation);
        Ok(true)
    }

    fn set_union(graph: &mut IrGraph, node: NodeId, parents: &[NodeId]) -> Result<bool> {
        let span = graph.operator(node).span;
        let first = graph.operator(parents[0]).relation().unwrap().clone();
        for &parent in &parents[1..] {
            let other = graph.operator(parent).relation().unwrap();
            let failed = match first.check_compatible(other) {
                CompatibilityCheck::Compatible => None,
                CompatibilityCheck::ColumnCountMismatch => Some("column count mismatch".to_string()),
                CompatibilityCheck::ColumnNameMismatch(c) => {
                    Some(format!("missing column '{c}'"))
                }
                CompatibilityCheck::ColumnTypeMismatch(c) => {
                    Some(format!("type mismatch for column '{c}'"))
                }
            };
            if let Some(check) = failed {
                return compile_err(
                    span,
                    format!(
                        "Union relations are incompatible: {} vs {}: {check}",
                        first.debug_string(),
                        other.debug_string()
                    ),
                );
            }
        }
        // Ordered column mapping per parent, used by union code-gen.
        let mut mappings = Vec::with_capacity(parents.len());
        for &parent in parents {
            let other = graph.operator(parent).relation().unwrap();
            let mapping: Vec<usize> = first
                .columns()
                .iter()
                .map(|c| other.column_index(&c.name).unwrap())
                .collect();
            mappings.push(mapping);
        }
        if let OperatorKind::Union { column_mappings } = &mut graph.operator_mut(node).kind {
            *column_mappings = mappings;
        }
        graph.set_relation(node, first);
        Ok(true)
    }

    fn set_join(graph: &mut IrGraph, node: NodeId, parents: &[NodeId]) -> Result<bool> {
        let span = graph.operator(node).span;
        let (specified_right, suffixes) = match &graph.operator(node).kind {
            OperatorKind::Join {
                specified_right,
                suffixes,
                ..
            } => (*specified_right, suffixes.clone()),
            _ => unreachable!("set_join on non-join"),
        };
        // Stored operand order may be swapped; emit columns in the user's
        // left-then-right order.
        let (user_left_side, user_right_side) = if specified_right { (1, 0) } else { (0, 1) };
        let left_relation = graph.operator(parents[user_left_side]).relation().unwrap();
        let right_relation = graph.operator(parents[user_right_side]).relation().unwrap();

        let mut relation = Relation::new();
        let mut output_columns = Vec::new();
        let mut push_column = |relation: &mut Relation,
                               name: String,
                               column: &Column,
                               side: usize,
                               index: usize|
         -> Result<()> {
            if relation.has_column(&name) {
                return compile_err(
                    span,
                    format!(
                        "duplicate column '{name}' after join suffixing with ('{}', '{}')",
                        suffixes.0, suffixes.1
                    ),
                );
            }
            let mut out = Column::new(name, column.data_type);
            out = out.with_semantic(column.semantic_type);
            relation.add_column(out);
            output_columns.push(JoinOutputColumn { side, index });
            Ok(())
        };
        for (idx, col) in left_relation.columns().iter().enumerate() {
            let name = if right_relation.has_column(&col.name) {
                format!("{}{}", col.name, suffixes.0)
            } else {
                col.name.clone()
            };
            push_column(&mut relation, name, col, user_left_side, idx)?;
        }
        for (idx, col) in right_relation.columns().iter().enumerate() {
            let name = if left_relation.has_column(&col.name) {
                format!("{}{}", col.name, suffixes.1)
            } else {
                col.name.clone()
            };
            push_column(&mut relation, name, col, user_right_side, idx)?;
        }
        if let OperatorKind::Join {
            output_columns: slot,
            ..
        } = &mut graph.operator_mut(node).kind
        {
            *slot = output_columns;
        }
        graph.set_relation(node, relation);
        Ok(true)
    }

    fn set_drop(
        graph: &mut IrGraph,
        node: NodeId,
        columns: Vec<String>,
        parent: NodeId,
    ) -> Result<bool> {
        let span = graph.operator(node).span;
        let parent_relation = graph.operator(parent).relation().unwrap().clone();
        for c in &columns {
            if !parent_relation.has_column(c) {
                return compile_err(
                    span,
                    format!(
                        "Column '{c}' not found in relation {}; cannot drop it.",
                        parent_relation.debug_string()
                    ),
                );
            }
        }
        let relation = Relation::from_columns(
            parent_relation
                .columns()
                .iter()
                .filter(|col| !columns.contains(&col.name))
                .cloned()
                .collect(),
        );
        graph.set_relation(node, relation);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// VerifyFilterExpressionRule
// ---------------------------------------------------------------------------

/// Filter predicates must resolve to Boolean.
pub struct VerifyFilterExpressionRule;

impl Rule for VerifyFilterExpressionRule {
    fn name(&self) -> &'static str {
        "VerifyFilterExpressionRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        let OperatorKind::Filter { predicate } = &op.kind else {
            return Ok(false);
        };
        let expr = graph.expr(*predicate);
        match expr.data_type {
            Some(DataType::Boolean) | None => Ok(false),
            Some(other) => compile_err(
                op.span,
                format!("Expected Boolean for Filter expression, got {other}"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata rules
// ---------------------------------------------------------------------------

/// Resolves a metadata reference's semantic property against the metadata
/// catalog.
pub struct ResolveMetadataPropertyRule<'a> {
    pub state: &'a CompilerState,
}

impl<'a> Rule for ResolveMetadataPropertyRule<'a> {
    fn name(&self) -> &'static str {
        "ResolveMetadataPropertyRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(expr) = graph.maybe_expr(node) else {
            return Ok(false);
        };
        let ExprKind::Metadata {
            name,
            property: None,
        } = &expr.kind
        else {
            return Ok(false);
        };
        let span = expr.span;
        let Some(property) = self.state.metadata().property(name) else {
            return compile_err(
                span,
                format!("Specified metadata value '{name}' is not properly handled."),
            );
        };
        let property = property.clone();
        if let ExprKind::Metadata { property: slot, .. } = &mut graph.expr_mut(node).kind {
            *slot = Some(property);
        }
        Ok(true)
    }
}

/// Rewrites a resolved metadata reference into a concrete function call over
/// a key column present in the containing operator's parent relation.
pub struct ConvertMetadataRule<'a> {
    pub state: &'a CompilerState,
}

impl<'a> Rule for ConvertMetadataRule<'a> {
    fn name(&self) -> &'static str {
        "ConvertMetadataRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(expr) = graph.maybe_expr(node) else {
            return Ok(false);
        };
        let ExprKind::Metadata {
            property: Some(property),
            ..
        } = &expr.kind
        else {
            return Ok(false);
        };
        let property = property.clone();
        let span = expr.span;
        let Some(container) = graph.containing_op(node) else {
            return Ok(false);
        };
        let parents = graph.parents_of(container);
        if parents.is_empty() {
            let op = graph.operator(container);
            return compile_err(
                span,
                format!(
                    "No parent for operator {}(id={}). Can't resolve metadata '{}'.",
                    op.kind.name(),
                    op.id,
                    property.name
                ),
            );
        }
        let parent = parents[0];
        let Some(relation) = graph.operator(parent).relation() else {
            return Ok(false);
        };

        // Already materialized upstream: reference the column directly.
        if relation.has_column(&property.column_repr()) {
            let column = graph.add_expr(
                span,
                ExprKind::Column {
                    name: property.column_repr(),
                    parent_idx: 0,
                },
            );
            graph.expr_mut(column).annotation = Some(property.semantic_type);
            graph.replace_expr_in_op(container, node, column);
            graph.delete_node(node);
            return Ok(true);
        }

        let Some(key_column) = property
            .key_columns
            .iter()
            .find(|k| relation.has_column(k))
        else {
            let needed = property.key_columns.join(",");
            let available = relation
                .col_names()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            return compile_err(
                span,
                format!(
                    "Can't resolve metadata '{}' because of lack of converting columns in the \
                     parent. Need one of [{needed}]. Parent relation has columns [{available}] \
                     available.",
                    property.name
                ),
            );
        };
        let key_column = key_column.clone();
        let column = graph.add_expr(
            span,
            ExprKind::Column {
                name: key_column,
                parent_idx: 0,
            },
        );
        let func = graph.add_expr(
            span,
            ExprKind::Func {
                name: property.udf_name.clone(),
                args: vec![column],
                arg_types: vec![],
            },
        );
        graph.expr_mut(func).annotation = Some(property.semantic_type);
        graph.replace_expr_in_op(container, node, func);
        graph.delete_node(node);
        Ok(true)
    }
}

/// User-facing column names may not use the reserved metadata prefix.
pub struct CheckMetadataColumnNamingRule;

impl Rule for CheckMetadataColumnNamingRule {
    fn name(&self) -> &'static str {
        "CheckMetadataColumnNamingRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        let names: Vec<&ColumnExpr> = match &op.kind {
            OperatorKind::Map { exprs, .. } => exprs.iter().collect(),
            OperatorKind::BlockingAgg { aggregates, .. } => aggregates.iter().collect(),
            _ => return Ok(false),
        };
        for ce in names {
            if ce.name.starts_with(METADATA_COLUMN_PREFIX) {
                return compile_err(
                    op.span,
                    format!(
                        "Column name '{}' violates naming rules. The '{METADATA_COLUMN_PREFIX}' \
                         prefix is reserved for internal use.",
                        ce.name
                    ),
                );
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Post-resolution verification sweep
// ---------------------------------------------------------------------------

/// Collect every remaining unresolved reachable node after the resolution
/// batch converged: unresolved functions/columns and operators without
/// relations. Errors accumulate into one group so the caller sees all of
/// them at once.
pub fn verify_resolved(graph: &IrGraph) -> Result<()> {
    let mut group = qv_common::ErrorGroup::new();
    for op_id in graph.operator_ids() {
        let op = graph.operator(op_id);
        if !op.is_relation_set() {
            group.push(qv_common::CompileError::at(
                op.span,
                format!(
                    "Operator {}(id={}) failed to resolve its relation.",
                    op.kind.name(),
                    op.id
                ),
            ));
        }
    }
    let live = graph.live_expr_nodes();
    let mut live_sorted: Vec<NodeId> = live.into_iter().collect();
    live_sorted.sort();
    for id in live_sorted {
        let expr = graph.expr(id);
        if expr.is_resolved() {
            continue;
        }
        match &expr.kind {
            ExprKind::Func { name, .. } if !name.is_empty() => {
                group.push(qv_common::CompileError::at(
                    expr.span,
                    format!("Function '{name}' failed to resolve."),
                ));
            }
            ExprKind::Column { name, .. } => {
                group.push(qv_common::CompileError::at(
                    expr.span,
                    format!("Column '{name}' failed to resolve."),
                ));
            }
            ExprKind::Metadata { name, .. } => {
                group.push(qv_common::CompileError::at(
                    expr.span,
                    format!("Metadata reference '{name}' failed to resolve."),
                ));
            }
            _ => {}
        }
    }
    if group.is_empty() {
        Ok(())
    } else {
        Err(qv_common::QvError::Compile(group))
    }
}
