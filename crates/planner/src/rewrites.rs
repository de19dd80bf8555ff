//! Structural rewrite rules: join normalization, groupby merging, map
//! fusion, liveness-based column pruning, garbage collection, and output
//! shaping.

use std::collections::{HashMap, HashSet};

use qv_common::{compile_err, NodeId, Result};

use crate::analysis::referenced_columns;
use crate::ir::{ColumnExpr, ExprKind, IrGraph, JoinKind, JoinOutputColumn, OperatorKind};
use crate::relation::Relation;
use crate::rules::Rule;
use crate::types::SemanticType;

// ---------------------------------------------------------------------------
// SetupJoinTypeRule
// ---------------------------------------------------------------------------

/// Rewrites a `right` join into a `left` join with swapped parent operands.
///
/// The user-specified orientation is retained on the operator so relation
/// computation can emit output columns in the order the user expects.
pub struct SetupJoinTypeRule;

impl Rule for SetupJoinTypeRule {
    fn name(&self) -> &'static str {
        "SetupJoinTypeRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        let OperatorKind::Join {
            how: JoinKind::Right,
            ..
        } = &op.kind
        else {
            return Ok(false);
        };
        // Flip operand references inside the join payload first.
        let closure = graph.expr_closure(&graph.op_expr_roots(node));
        for id in closure {
            if let Some(expr) = graph.maybe_expr(id) {
                if matches!(expr.kind, ExprKind::Column { .. }) {
                    if let ExprKind::Column { parent_idx, .. } = &mut graph.expr_mut(id).kind {
                        *parent_idx = 1 - *parent_idx;
                    }
                }
            }
        }
        graph.swap_parents(node);
        if let OperatorKind::Join {
            how,
            specified_right,
            left_on,
            right_on,
            ..
        } = &mut graph.operator_mut(node).kind
        {
            *how = JoinKind::Left;
            *specified_right = true;
            std::mem::swap(left_on, right_on);
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MergeGroupByIntoGroupAcceptorRule
// ---------------------------------------------------------------------------

/// Folds a GroupBy's keys into an immediately-downstream group acceptor
/// (BlockingAgg or Rolling) and rewires the acceptor past the GroupBy.
///
/// Group columns are merged as fresh deep copies so two consumers of one
/// GroupBy never alias expression nodes. The GroupBy node itself is left in
/// place for [`RemoveGroupByRule`].
pub struct MergeGroupByIntoGroupAcceptorRule;

impl Rule for MergeGroupByIntoGroupAcceptorRule {
    fn name(&self) -> &'static str {
        "MergeGroupByIntoGroupAcceptorRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        if !op.kind.is_group_acceptor() {
            return Ok(false);
        }
        let parents = graph.parents_of(node).to_vec();
        let &[groupby] = parents.as_slice() else {
            return Ok(false);
        };
        let OperatorKind::GroupBy { groups } = &graph.operator(groupby).kind else {
            return Ok(false);
        };
        let group_ids = groups.clone();
        let groupby_parent = graph.parents_of(groupby).to_vec()[0];

        let copies: Vec<NodeId> = group_ids
            .iter()
            .map(|&g| graph.deep_copy_expr(g))
            .collect();
        match &mut graph.operator_mut(node).kind {
            OperatorKind::BlockingAgg { groups, .. } | OperatorKind::Rolling { groups, .. } => {
                groups.extend(copies);
            }
            _ => unreachable!("group acceptor changed kind mid-rule"),
        }
        graph.replace_parent(node, groupby, groupby_parent);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// RemoveGroupByRule
// ---------------------------------------------------------------------------

/// Deletes GroupBy nodes that have been fully absorbed (no children left).
/// A GroupBy still feeding a non-acceptor is a compile error.
pub struct RemoveGroupByRule;

impl Rule for RemoveGroupByRule {
    fn name(&self) -> &'static str {
        "RemoveGroupByRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        let OperatorKind::GroupBy { .. } = &op.kind else {
            return Ok(false);
        };
        if graph.children_of(node).is_empty() {
            graph.delete_node(node);
            return Ok(true);
        }
        compile_err(op.span, "'groupby' must be followed by an agg")
    }
}

// ---------------------------------------------------------------------------
// UniqueSinkNameRule
// ---------------------------------------------------------------------------

/// De-duplicates sink names: the first occurrence keeps its name, each later
/// duplicate gets a `_N` suffix with N counted per distinct base name, in
/// discovery (id) order.
pub struct UniqueSinkNameRule;

impl Rule for UniqueSinkNameRule {
    fn name(&self) -> &'static str {
        "UniqueSinkNameRule"
    }

    fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut changed = false;
        for id in graph.find_ops_that_match(|op| op.kind.is_sink()) {
            let OperatorKind::MemorySink { name } = &graph.operator(id).kind else {
                continue;
            };
            let base = name.clone();
            let seen = counts.entry(base.clone()).or_insert(0);
            *seen += 1;
            if *seen > 1 {
                let unique = format!("{base}_{}", *seen - 1);
                if let OperatorKind::MemorySink { name } = &mut graph.operator_mut(id).kind {
                    *name = unique;
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// CombineConsecutiveMapsRule
// ---------------------------------------------------------------------------

/// Fuses a Map directly feeding another Map into one Map.
///
/// Requirements:
/// - the child keeps input columns (sequential-assignment shape) and is the
///   parent's only consumer;
/// - when the parent does not keep input columns, the child's expressions
///   may not reference any parent-computed output column (those names are
///   not visible once fused).
///
/// The fused expression list is the parent's (minus entries shadowed by the
/// child) followed by the child's; the fused Map inherits the parent's
/// keep-input flag and the child's relation.
pub struct CombineConsecutiveMapsRule;

impl Rule for CombineConsecutiveMapsRule {
    fn name(&self) -> &'static str {
        "CombineConsecutiveMapsRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        let OperatorKind::Map {
            exprs: child_exprs,
            keep_input_columns: true,
        } = &op.kind
        else {
            return Ok(false);
        };
        let child_exprs = child_exprs.clone();
        let parents = graph.parents_of(node).to_vec();
        let &[parent] = parents.as_slice() else {
            return Ok(false);
        };
        let OperatorKind::Map {
            exprs: parent_exprs,
            keep_input_columns: parent_keep,
        } = &graph.operator(parent).kind
        else {
            return Ok(false);
        };
        let parent_exprs = parent_exprs.clone();
        let parent_keep = *parent_keep;
        if graph.children_of(parent) != [node] {
            return Ok(false);
        }

        if !parent_keep {
            let parent_names: HashSet<&str> =
                parent_exprs.iter().map(|ce| ce.name.as_str()).collect();
            let child_roots: Vec<NodeId> =
                child_exprs.iter().map(|ce| ce.expr).collect();
            let child_refs = referenced_columns(graph, &child_roots);
            if child_refs
                .iter()
                .any(|(_, name)| parent_names.contains(name.as_str()))
            {
                return Ok(false);
            }
        }

        let child_names: HashSet<&str> = child_exprs.iter().map(|ce| ce.name.as_str()).collect();
        let mut merged: Vec<ColumnExpr> = parent_exprs
            .iter()
            .filter(|ce| !child_names.contains(ce.name.as_str()))
            .cloned()
            .collect();
        merged.extend(child_exprs);

        let grandparent = graph.parents_of(parent).to_vec()[0];
        if let OperatorKind::Map {
            exprs,
            keep_input_columns,
        } = &mut graph.operator_mut(node).kind
        {
            *exprs = merged;
            *keep_input_columns = parent_keep;
        }
        graph.replace_parent(node, parent, grandparent);
        graph.delete_node(parent);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// PruneUnusedColumnsRule
// ---------------------------------------------------------------------------

/// Backward (sink-to-source) liveness analysis over column names.
///
/// Starting from each sink's required output set, computes the minimal
/// column set each operator must retain, then prunes Map expression lists
/// and MemorySource column lists and restricts affected relations. The
/// no-op check compares the full proposed state, so a converged graph
/// reports no change on re-run.
pub struct PruneUnusedColumnsRule;

impl PruneUnusedColumnsRule {
    fn full_set(relation: &Relation) -> HashSet<String> {
        relation
            .col_names()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn ref_names(graph: &IrGraph, roots: &[NodeId]) -> HashSet<String> {
        referenced_columns(graph, roots)
            .into_iter()
            .map(|(_, name)| name)
            .collect()
    }

    /// Per-parent required-column contributions of `node` given its own
    /// required output set.
    fn parent_contributions(
        graph: &IrGraph,
        node: NodeId,
        out_set: &HashSet<String>,
    ) -> Vec<(NodeId, HashSet<String>)> {
        let op = graph.operator(node);
        let parents = graph.parents_of(node);
        match &op.kind {
            OperatorKind::MemorySink { .. } => vec![(parents[0], out_set.clone())],
            OperatorKind::Map {
                exprs,
                keep_input_columns,
            } => {
                let kept_roots: Vec<NodeId> = exprs
                    .iter()
                    .filter(|ce| out_set.contains(&ce.name))
                    .map(|ce| ce.expr)
                    .collect();
                let mut need = Self::ref_names(graph, &kept_roots);
                if *keep_input_columns {
                    let expr_names: HashSet<&str> =
                        exprs.iter().map(|ce| ce.name.as_str()).collect();
                    need.extend(
                        out_set
                            .iter()
                            .filter(|n| !expr_names.contains(n.as_str()))
                            .cloned(),
                    );
                }
                vec![(parents[0], need)]
            }
            OperatorKind::Filter { predicate } => {
                let mut need = out_set.clone();
                need.extend(Self::ref_names(graph, &[*predicate]));
                vec![(parents[0], need)]
            }
            OperatorKind::Limit { .. } | OperatorKind::Drop { .. } => {
                vec![(parents[0], out_set.clone())]
            }
            OperatorKind::GroupBy { groups } => {
                let mut need = out_set.clone();
                need.extend(Self::ref_names(graph, groups));
                vec![(parents[0], need)]
            }
            OperatorKind::Rolling {
                groups, window_col, ..
            } => {
                let mut need = out_set.clone();
                need.extend(Self::ref_names(graph, groups));
                need.insert(window_col.clone());
                vec![(parents[0], need)]
            }
            OperatorKind::BlockingAgg { groups, aggregates } => {
                let mut need = Self::ref_names(graph, groups);
                let agg_roots: Vec<NodeId> = aggregates.iter().map(|ce| ce.expr).collect();
                need.extend(Self::ref_names(graph, &agg_roots));
                vec![(parents[0], need)]
            }
            OperatorKind::Join {
                output_columns,
                left_on,
                right_on,
                ..
            } => {
                let mut needs: Vec<HashSet<String>> = vec![HashSet::new(), HashSet::new()];
                let relation = op.relation().unwrap();
                for (i, col) in relation.columns().iter().enumerate() {
                    if !out_set.contains(&col.name) {
                        continue;
                    }
                    let JoinOutputColumn { side, index } = output_columns[i];
                    let side_relation = graph.operator(parents[side]).relation().unwrap();
                    needs[side].insert(side_relation.column(index).name.clone());
                }
                for (idx, name) in referenced_columns(graph, left_on)
                    .into_iter()
                    .chain(referenced_columns(graph, right_on))
                {
                    needs[idx].insert(name);
                }
                vec![(parents[0], needs[0].clone()), (parents[1], needs[1].clone())]
            }
            OperatorKind::Union { column_mappings } => {
                let relation = op.relation().unwrap();
                let mut out = Vec::new();
                for (p, &parent) in parents.iter().enumerate() {
                    let parent_relation = graph.operator(parent).relation().unwrap();
                    let mut need = HashSet::new();
                    for (i, col) in relation.columns().iter().enumerate() {
                        if out_set.contains(&col.name) {
                            let idx = column_mappings[p][i];
                            need.insert(parent_relation.column(idx).name.clone());
                        }
                    }
                    out.push((parent, need));
                }
                out
            }
            OperatorKind::MemorySource { .. } | OperatorKind::UdtfSource { .. } => Vec::new(),
        }
    }
}

impl Rule for PruneUnusedColumnsRule {
    fn name(&self) -> &'static str {
        "PruneUnusedColumnsRule"
    }

    fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let op_ids = graph.operator_ids();
        // Liveness needs a fully resolved graph.
        if op_ids.is_empty()
            || op_ids
                .iter()
                .any(|&id| !graph.operator(id).is_relation_set())
        {
            return Ok(false);
        }
        let topo = graph.dag().topological_sort();

        // Phase 1: backward liveness. Children appear before their parents
        // in the reversed order, so every operator's required set is final
        // before it contributes to its parents.
        let mut required: HashMap<NodeId, HashSet<String>> = HashMap::new();
        for &id in &op_ids {
            let op = graph.operator(id);
            if op.kind.is_sink() {
                required.insert(id, Self::full_set(op.relation().unwrap()));
            }
        }
        for &node in topo.iter().rev() {
            let out_set = required
                .get(&node)
                .cloned()
                .unwrap_or_else(|| Self::full_set(graph.operator(node).relation().unwrap()));
            for (parent, contribution) in Self::parent_contributions(graph, node, &out_set) {
                required.entry(parent).or_default().extend(contribution);
            }
        }

        // Phase 2: prune payloads and restrict relations, parents first so
        // join/union index rebuilds can look at final parent relations.
        let old_relations: HashMap<NodeId, Relation> = op_ids
            .iter()
            .map(|&id| (id, graph.operator(id).relation().unwrap().clone()))
            .collect();
        let mut changed = false;
        for &node in &topo {
            let old_relation = &old_relations[&node];
            let out_set = required
                .get(&node)
                .cloned()
                .unwrap_or_else(|| Self::full_set(old_relation));
            let new_relation = old_relation.restricted_to(&out_set);
            let kind = graph.operator(node).kind.clone();
            match kind {
                OperatorKind::MemorySink { .. } => {}
                OperatorKind::Map { exprs, .. } => {
                    let kept: Vec<ColumnExpr> = exprs
                        .iter()
                        .filter(|ce| out_set.contains(&ce.name))
                        .cloned()
                        .collect();
                    if kept.len() != exprs.len() || new_relation != *old_relation {
                        if let OperatorKind::Map { exprs: slot, .. } =
                            &mut graph.operator_mut(node).kind
                        {
                            *slot = kept;
                        }
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
                OperatorKind::MemorySource { .. } => {
                    if new_relation != *old_relation {
                        let names: Vec<String> = new_relation
                            .col_names()
                            .iter()
                            .map(|s| s.to_string())
                            .collect();
                        if let OperatorKind::MemorySource { column_names, .. } =
                            &mut graph.operator_mut(node).kind
                        {
                            *column_names = names;
                        }
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
                // Join/Union payloads index into parent relations, so they
                // must be rebuilt even when this operator's own relation is
                // untouched (parent pruning shifts indices).
                OperatorKind::Join { output_columns, .. } => {
                    let parents = graph.parents_of(node).to_vec();
                    let mut rebuilt = Vec::new();
                    for (i, col) in old_relation.columns().iter().enumerate() {
                        if !out_set.contains(&col.name) {
                            continue;
                        }
                        let JoinOutputColumn { side, index } = output_columns[i];
                        let source_name = &old_relations[&parents[side]].column(index).name;
                        let new_index = graph
                            .operator(parents[side])
                            .relation()
                            .unwrap()
                            .column_index(source_name)
                            .expect("live join input column survived pruning");
                        rebuilt.push(JoinOutputColumn {
                            side,
                            index: new_index,
                        });
                    }
                    if rebuilt != output_columns || new_relation != *old_relation {
                        if let OperatorKind::Join {
                            output_columns: slot,
                            ..
                        } = &mut graph.operator_mut(node).kind
                        {
                            *slot = rebuilt;
                        }
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
                OperatorKind::Union { column_mappings } => {
                    let parents = graph.parents_of(node).to_vec();
                    let mut rebuilt: Vec<Vec<usize>> = vec![Vec::new(); parents.len()];
                    for (i, col) in old_relation.columns().iter().enumerate() {
                        if !out_set.contains(&col.name) {
                            continue;
                        }
                        for (p, &parent) in parents.iter().enumerate() {
                            let source_name =
                                &old_relations[&parent].column(column_mappings[p][i]).name;
                            let new_index = graph
                                .operator(parent)
                                .relation()
                                .unwrap()
                                .column_index(source_name)
                                .expect("live union input column survived pruning");
                            rebuilt[p].push(new_index);
                        }
                    }
                    if rebuilt != column_mappings || new_relation != *old_relation {
                        if let OperatorKind::Union {
                            column_mappings: slot,
                        } = &mut graph.operator_mut(node).kind
                        {
                            *slot = rebuilt;
                        }
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
                OperatorKind::Drop { columns } => {
                    let parent = graph.parents_of(node)[0];
                    let parent_relation = graph.operator(parent).relation().unwrap();
                    let kept: Vec<String> = columns
                        .iter()
                        .filter(|c| parent_relation.has_column(c))
                        .cloned()
                        .collect();
                    if kept != columns || new_relation != *old_relation {
                        if let OperatorKind::Drop { columns: slot } =
                            &mut graph.operator_mut(node).kind
                        {
                            *slot = kept;
                        }
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
                OperatorKind::Filter { .. }
                | OperatorKind::Limit { .. }
                | OperatorKind::GroupBy { .. }
                | OperatorKind::Rolling { .. }
                | OperatorKind::BlockingAgg { .. }
                | OperatorKind::UdtfSource { .. } => {
                    if new_relation != *old_relation {
                        graph.replace_relation(node, new_relation);
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// CleanUpStrayIRNodesRule
// ---------------------------------------------------------------------------

/// Garbage-collects expression nodes unreachable from any operator payload.
pub struct CleanUpStrayIRNodesRule;

impl Rule for CleanUpStrayIRNodesRule {
    fn name(&self) -> &'static str {
        "CleanUpStrayIRNodesRule"
    }

    fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let live = graph.live_expr_nodes();
        let mut changed = false;
        for id in graph.expression_ids() {
            if !live.contains(&id) {
                graph.delete_node(id);
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// PruneUnconnectedOperatorsRule
// ---------------------------------------------------------------------------

/// Deletes operator subtrees that cannot reach any sink.
pub struct PruneUnconnectedOperatorsRule;

impl Rule for PruneUnconnectedOperatorsRule {
    fn name(&self) -> &'static str {
        "PruneUnconnectedOperatorsRule"
    }

    fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let sinks = graph.find_ops_that_match(|op| op.kind.is_sink());
        if sinks.is_empty() {
            return Ok(false);
        }
        let mut reaches_sink: HashSet<NodeId> = HashSet::new();
        let mut stack = sinks;
        while let Some(node) = stack.pop() {
            if reaches_sink.insert(node) {
                stack.extend(graph.parents_of(node).iter().copied());
            }
        }
        let mut changed = false;
        for id in graph.operator_ids() {
            if !reaches_sink.contains(&id) {
                graph.delete_node(id);
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// AddLimitToResultSinkRule
// ---------------------------------------------------------------------------

/// Applies the configured result row cap: inserts a Limit immediately above
/// each sink, or tightens an existing one. Existing limits are only ever
/// lowered.
pub struct AddLimitToResultSinkRule {
    pub max_output_rows: Option<i64>,
}

impl Rule for AddLimitToResultSinkRule {
    fn name(&self) -> &'static str {
        "AddLimitToResultSinkRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(cap) = self.max_output_rows else {
            return Ok(false);
        };
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        if !op.kind.is_sink() {
            return Ok(false);
        }
        let span = op.span;
        let parent = graph.parents_of(node)[0];
        if let OperatorKind::Limit { n } = &graph.operator(parent).kind {
            if *n <= cap {
                return Ok(false);
            }
            if let OperatorKind::Limit { n } = &mut graph.operator_mut(parent).kind {
                *n = cap;
            }
            return Ok(true);
        }
        let parent_relation = graph.operator(parent).relation().cloned();
        let limit = graph.add_operator(span, OperatorKind::Limit { n: cap }, &[parent])?;
        if let Some(relation) = parent_relation {
            graph.set_relation(limit, relation);
        }
        graph.insert_between(limit, parent, node);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// PropagateExpressionAnnotationsRule
// ---------------------------------------------------------------------------

/// Forward-propagates semantic annotations through pure renames and
/// pass-through operators.
///
/// A column keeps its annotation only while it is a rename/pass-through of
/// an annotated source column; Union keeps an annotation only when every
/// input's mapped column carries the identical one, and divergent cases drop
/// to no annotation.
pub struct PropagateExpressionAnnotationsRule;

impl Rule for PropagateExpressionAnnotationsRule {
    fn name(&self) -> &'static str {
        "PropagateExpressionAnnotationsRule"
    }

    fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let op_ids = graph.operator_ids();
        if op_ids
            .iter()
            .any(|&id| !graph.operator(id).is_relation_set())
        {
            return Ok(false);
        }
        let topo = graph.dag().topological_sort();
        let mut out_maps: HashMap<NodeId, HashMap<String, SemanticType>> = HashMap::new();
        let mut changed = false;

        for node in topo {
            let parents = graph.parents_of(node).to_vec();
            let kind = graph.operator(node).kind.clone();
            let empty = HashMap::new();
            let parent_map = parents
                .first()
                .and_then(|p| out_maps.get(p))
                .unwrap_or(&empty)
                .clone();
            let mut map: HashMap<String, SemanticType> = HashMap::new();

            match &kind {
                OperatorKind::MemorySource { .. } | OperatorKind::UdtfSource { .. } => {
                    let relation = graph.operator(node).relation().unwrap();
                    for col in relation.columns() {
                        if col.semantic_type != SemanticType::None {
                            map.insert(col.name.clone(), col.semantic_type);
                        }
                    }
                }
                OperatorKind::Map {
                    exprs,
                    keep_input_columns,
                } => {
                    if *keep_input_columns {
                        let expr_names: HashSet<&str> =
                            exprs.iter().map(|ce| ce.name.as_str()).collect();
                        for (name, ann) in &parent_map {
                            if !expr_names.contains(name.as_str()) {
                                map.insert(name.clone(), *ann);
                            }
                        }
                    }
                    for ce in exprs {
                        let expr = graph.expr(ce.expr);
                        let annotation = match &expr.kind {
                            ExprKind::Column {
                                name,
                                parent_idx: 0,
                            } => parent_map.get(name).copied().or(expr.annotation),
                            _ => expr.annotation,
                        };
                        if let Some(ann) = annotation {
                            map.insert(ce.name.clone(), ann);
                            if matches!(expr.kind, ExprKind::Column { .. })
                                && expr.annotation != Some(ann)
                            {
                                graph.expr_mut(ce.expr).annotation = Some(ann);
                                changed = true;
                            }
                        }
                    }
                }
                OperatorKind::Filter { .. }
                | OperatorKind::Limit { .. }
                | OperatorKind::GroupBy { .. }
                | OperatorKind::Rolling { .. }
                | OperatorKind::MemorySink { .. } => {
                    map = parent_map.clone();
                }
                OperatorKind::Drop { columns } => {
                    map = parent_map.clone();
                    for c in columns {
                        map.remove(c);
                    }
                }
                OperatorKind::BlockingAgg { groups, .. } => {
                    for &group in groups {
                        let expr = graph.expr(group);
                        if let ExprKind::Column { name, .. } = &expr.kind {
                            if let Some(ann) =
                                parent_map.get(name).copied().or(expr.annotation)
                            {
                                map.insert(name.clone(), ann);
                            }
                        }
                    }
                }
                OperatorKind::Join { output_columns, .. } => {
                    let relation = graph.operator(node).relation().unwrap().clone();
                    for (i, col) in relation.columns().iter().enumerate() {
                        let JoinOutputColumn { side, index } = output_columns[i];
                        let side_relation = graph.operator(parents[side]).relation().unwrap();
                        let source_name = &side_relation.column(index).name;
                        if let Some(ann) = out_maps
                            .get(&parents[side])
                            .and_then(|m| m.get(source_name))
                        {
                            map.insert(col.name.clone(), *ann);
                        }
                    }
                }
                OperatorKind::Union { column_mappings } => {
                    let relation = graph.operator(node).relation().unwrap().clone();
                    for (i, col) in relation.columns().iter().enumerate() {
                        let mut shared: Option<SemanticType> = None;
                        let mut consistent = true;
                        for (p, &parent) in parents.iter().enumerate() {
                            let parent_relation = graph.operator(parent).relation().unwrap();
                            let source_name =
                                &parent_relation.column(column_mappings[p][i]).name;
                            let ann = out_maps
                                .get(&parent)
                                .and_then(|m| m.get(source_name))
                                .copied();
                            match (shared, ann) {
                                (None, Some(a)) if p == 0 => shared = Some(a),
                                (Some(s), Some(a)) if s == a => {}
                                _ => {
                                    consistent = false;
                                    break;
                                }
                            }
                        }
                        if consistent {
                            if let Some(ann) = shared {
                                map.insert(col.name.clone(), ann);
                            }
                        }
                    }
                }
            }

            // Reflect annotations into the operator's relation so sinks
            // carry semantic types.
            let relation = graph.operator(node).relation().unwrap().clone();
            let mut new_columns = relation.columns().to_vec();
            let mut relation_changed = false;
            for col in &mut new_columns {
                let target = map.get(&col.name).copied().unwrap_or(SemanticType::None);
                if col.semantic_type != target {
                    col.semantic_type = target;
                    relation_changed = true;
                }
            }
            if relation_changed {
                graph.replace_relation(node, Relation::from_columns(new_columns));
                changed = true;
            }
            out_maps.insert(node, map);
        }
        Ok(changed)
    }
}
