use std::collections::{HashSet, VecDeque};

use qv_common::{compile_err, NodeId, Result, SourceSpan};
use serde::{Deserialize, Serialize};

use crate::dag::Dag;
use crate::metadata::MetadataProperty;
use crate::relation::Relation;
use crate::types::{DataType, LiteralValue, SemanticType};

/// Named expression entry inside a Map or BlockingAgg payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExpr {
    pub name: String,
    pub expr: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
}

/// Resolved output column of a join: which side it came from and the column
/// index within that side's relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOutputColumn {
    pub side: usize,
    pub index: usize,
}

/// Placement policy for a UDTF source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdtfExecutor {
    AllAgents,
    AllDataNodes,
    AllCoordinators,
    OneCoordinator,
    SubsetDataNodes,
    SubsetCoordinators,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdtfArgSpec {
    pub name: String,
    pub data_type: DataType,
    pub semantic_type: SemanticType,
}

/// Declared shape of a user-defined table function.
#[derive(Debug, Clone, PartialEq)]
pub struct UdtfSpec {
    pub name: String,
    pub executor: UdtfExecutor,
    pub args: Vec<UdtfArgSpec>,
    pub relation: Relation,
}

/// Closed set of relational operators.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    MemorySource {
        table: String,
        /// Explicit column subset; empty means "all columns" in catalog order.
        column_names: Vec<String>,
        /// Unresolved start/stop time expressions.
        time_start: Option<NodeId>,
        time_stop: Option<NodeId>,
        /// Absolute nanosecond bounds once resolved.
        time_start_ns: Option<i64>,
        time_stop_ns: Option<i64>,
    },
    MemorySink {
        name: String,
    },
    Map {
        exprs: Vec<ColumnExpr>,
        keep_input_columns: bool,
    },
    Filter {
        predicate: NodeId,
    },
    Limit {
        n: i64,
    },
    BlockingAgg {
        groups: Vec<NodeId>,
        aggregates: Vec<ColumnExpr>,
    },
    GroupBy {
        groups: Vec<NodeId>,
    },
    Join {
        how: JoinKind,
        /// Orientation the user asked for; `how` is rewritten to `Left` for
        /// right joins, and output columns are emitted in the user's order.
        specified_right: bool,
        left_on: Vec<NodeId>,
        right_on: Vec<NodeId>,
        suffixes: (String, String),
        /// Filled by relation resolution; one entry per output column.
        output_columns: Vec<JoinOutputColumn>,
    },
    Union {
        /// Per-parent mapping: output column index -> parent column index.
        /// Filled by relation resolution.
        column_mappings: Vec<Vec<usize>>,
    },
    Rolling {
        window_col: String,
        window_size: NodeId,
        window_size_ns: Option<i64>,
        groups: Vec<NodeId>,
    },
    Drop {
        columns: Vec<String>,
    },
    UdtfSource {
        spec: UdtfSpec,
        arg_values: Vec<NodeId>,
    },
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::MemorySource { .. } => "MemorySource",
            OperatorKind::MemorySink { .. } => "MemorySink",
            OperatorKind::Map { .. } => "Map",
            OperatorKind::Filter { .. } => "Filter",
            OperatorKind::Limit { .. } => "Limit",
            OperatorKind::BlockingAgg { .. } => "BlockingAgg",
            OperatorKind::GroupBy { .. } => "GroupBy",
            OperatorKind::Join { .. } => "Join",
            OperatorKind::Union { .. } => "Union",
            OperatorKind::Rolling { .. } => "Rolling",
            OperatorKind::Drop { .. } => "Drop",
            OperatorKind::UdtfSource { .. } => "UdtfSource",
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self,
            OperatorKind::MemorySource { .. } | OperatorKind::UdtfSource { .. }
        )
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, OperatorKind::MemorySink { .. })
    }

    /// Operators that absorb a preceding GroupBy's keys.
    pub fn is_group_acceptor(&self) -> bool {
        matches!(
            self,
            OperatorKind::BlockingAgg { .. } | OperatorKind::Rolling { .. }
        )
    }

    fn expected_parent_count(&self) -> Option<usize> {
        match self {
            OperatorKind::MemorySource { .. } | OperatorKind::UdtfSource { .. } => Some(0),
            OperatorKind::Join { .. } => Some(2),
            OperatorKind::Union { .. } => None,
            _ => Some(1),
        }
    }
}

/// Closed set of scalar expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Reference to a column of the `parent_idx`-th parent operand of the
    /// containing operator. Resolution requires that parent's relation.
    Column { name: String, parent_idx: usize },
    Literal(LiteralValue),
    /// Function call. An empty name marks a compiler-internal placeholder
    /// that type resolution skips.
    Func {
        name: String,
        args: Vec<NodeId>,
        arg_types: Vec<DataType>,
    },
    /// Semantic metadata reference, later converted into a function call
    /// over a real key column.
    Metadata {
        name: String,
        property: Option<MetadataProperty>,
    },
    Tuple { items: Vec<NodeId> },
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Column { .. } => "Column",
            ExprKind::Literal(_) => "Literal",
            ExprKind::Func { .. } => "Func",
            ExprKind::Metadata { .. } => "Metadata",
            ExprKind::Tuple { .. } => "Tuple",
        }
    }
}

/// Relational operator node.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub id: NodeId,
    pub span: SourceSpan,
    pub kind: OperatorKind,
    relation: Option<Relation>,
}

impl OperatorNode {
    pub fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    pub fn is_relation_set(&self) -> bool {
        self.relation.is_some()
    }
}

/// Scalar expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub id: NodeId,
    pub span: SourceSpan,
    pub kind: ExprKind,
    pub data_type: Option<DataType>,
    /// Semantic tag propagated through renames; `None` is "no annotation".
    pub annotation: Option<SemanticType>,
}

impl ExprNode {
    pub fn is_resolved(&self) -> bool {
        self.data_type.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrNode {
    Op(OperatorNode),
    Expr(ExprNode),
}

impl IrNode {
    pub fn id(&self) -> NodeId {
        match self {
            IrNode::Op(op) => op.id,
            IrNode::Expr(e) => e.id,
        }
    }

    pub fn is_op(&self) -> bool {
        matches!(self, IrNode::Op(_))
    }
}

/// The IR graph: an arena of operator and expression nodes plus one [`Dag`]
/// tracking operator-to-operator dependencies.
///
/// Expression nodes are linked through direct argument ids and do not
/// participate in the DAG. Node ids are never reused within one compilation.
#[derive(Debug, Clone, Default)]
pub struct IrGraph {
    nodes: std::collections::BTreeMap<NodeId, IrNode>,
    dag: Dag,
    next_id: u64,
}

impl IrGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Allocate and register an operator, wiring DAG edges from `parents`.
    ///
    /// Construction-time validation failures (wrong arity, negative limit)
    /// are compile errors carrying `span`.
    pub fn add_operator(
        &mut self,
        span: SourceSpan,
        kind: OperatorKind,
        parents: &[NodeId],
    ) -> Result<NodeId> {
        if let Some(expected) = kind.expected_parent_count() {
            if parents.len() != expected {
                return compile_err(
                    span,
                    format!(
                        "{} expects {} parent(s), got {}",
                        kind.name(),
                        expected,
                        parents.len()
                    ),
                );
            }
        } else if parents.len() < 2 {
            return compile_err(
                span,
                format!("{} expects at least 2 parents, got {}", kind.name(), parents.len()),
            );
        }
        if let OperatorKind::Limit { n } = &kind {
            if *n < 0 {
                return compile_err(span, format!("Limit must be non-negative, got {n}"));
            }
        }
        for parent in parents {
            assert!(
                self.maybe_op(*parent).is_some(),
                "parent {parent} is not a registered operator"
            );
        }

        let id = self.fresh_id();
        self.dag.add_node(id);
        for &parent in parents {
            self.dag.add_edge(parent, id);
        }
        self.nodes.insert(
            id,
            IrNode::Op(OperatorNode {
                id,
                span,
                kind,
                relation: None,
            }),
        );
        Ok(id)
    }

    /// Allocate and register an expression node. Literal types resolve
    /// immediately.
    pub fn add_expr(&mut self, span: SourceSpan, kind: ExprKind) -> NodeId {
        let data_type = match &kind {
            ExprKind::Literal(v) => Some(v.data_type()),
            _ => None,
        };
        let id = self.fresh_id();
        self.nodes.insert(
            id,
            IrNode::Expr(ExprNode {
                id,
                span,
                kind,
                data_type,
                annotation: None,
            }),
        );
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&IrNode> {
        self.nodes.get(&id)
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn maybe_op(&self, id: NodeId) -> Option<&OperatorNode> {
        match self.nodes.get(&id) {
            Some(IrNode::Op(op)) => Some(op),
            _ => None,
        }
    }

    pub fn maybe_expr(&self, id: NodeId) -> Option<&ExprNode> {
        match self.nodes.get(&id) {
            Some(IrNode::Expr(e)) => Some(e),
            _ => None,
        }
    }

    pub fn operator(&self, id: NodeId) -> &OperatorNode {
        self.maybe_op(id)
            .unwrap_or_else(|| panic!("node {id} is not an operator"))
    }

    pub fn operator_mut(&mut self, id: NodeId) -> &mut OperatorNode {
        match self.nodes.get_mut(&id) {
            Some(IrNode::Op(op)) => op,
            _ => panic!("node {id} is not an operator"),
        }
    }

    pub fn expr(&self, id: NodeId) -> &ExprNode {
        self.maybe_expr(id)
            .unwrap_or_else(|| panic!("node {id} is not an expression"))
    }

    pub fn expr_mut(&mut self, id: NodeId) -> &mut ExprNode {
        match self.nodes.get_mut(&id) {
            Some(IrNode::Expr(e)) => e,
            _ => panic!("node {id} is not an expression"),
        }
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Ordered parent operators of `op`.
    pub fn parents_of(&self, op: NodeId) -> &[NodeId] {
        self.dag.parents_of(op)
    }

    /// Ordered child operators of `op`.
    pub fn children_of(&self, op: NodeId) -> &[NodeId] {
        self.dag.children_of(op)
    }

    /// Set an operator's relation. Setting twice is a programming error.
    pub fn set_relation(&mut self, op: NodeId, relation: Relation) {
        let node = self.operator_mut(op);
        assert!(
            node.relation.is_none(),
            "relation for operator {op} already set"
        );
        node.relation = Some(relation);
    }

    /// Replace an already-set relation (used by column pruning).
    pub fn replace_relation(&mut self, op: NodeId, relation: Relation) {
        let node = self.operator_mut(op);
        assert!(
            node.relation.is_some(),
            "operator {op} has no relation to replace"
        );
        node.relation = Some(relation);
    }

    /// Remove one node. Operators also leave the DAG (incident edges first).
    pub fn delete_node(&mut self, id: NodeId) {
        if self.maybe_op(id).is_some() {
            self.dag.delete_node(id);
        }
        self.nodes.remove(&id);
    }

    /// Delete `root` and every descendant operator left without parents,
    /// cascading downwards.
    pub fn delete_orphans_in_subtree(&mut self, root: NodeId) {
        let mut queue = VecDeque::from([root]);
        let mut first = true;
        while let Some(id) = queue.pop_front() {
            if !self.has_node(id) {
                continue;
            }
            if !first && !self.dag.parents_of(id).is_empty() {
                continue;
            }
            first = false;
            let children: Vec<NodeId> = self.dag.children_of(id).to_vec();
            self.delete_node(id);
            queue.extend(children);
        }
    }

    /// Rewire `child` from `old_parent` to `new_parent`, preserving operand
    /// position.
    pub fn replace_parent(&mut self, child: NodeId, old_parent: NodeId, new_parent: NodeId) {
        self.dag.replace_parent_edge(child, old_parent, new_parent);
    }

    /// Swap a two-parent operator's operand order.
    pub fn swap_parents(&mut self, op: NodeId) {
        let parents = self.dag.parents_of(op).to_vec();
        assert_eq!(parents.len(), 2, "swap_parents requires exactly 2 parents");
        self.dag.delete_edge(parents[0], op);
        self.dag.delete_edge(parents[1], op);
        self.dag.add_edge(parents[1], op);
        self.dag.add_edge(parents[0], op);
    }

    /// Insert `middle` between `parent` and `child` (child keeps operand
    /// position; `middle` must already have `parent` as its sole parent).
    pub fn insert_between(&mut self, middle: NodeId, parent: NodeId, child: NodeId) {
        self.dag.replace_parent_edge(child, parent, middle);
    }

    /// All operator ids in ascending id order.
    pub fn operator_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| match n {
                IrNode::Op(op) => Some(op.id),
                IrNode::Expr(_) => None,
            })
            .collect()
    }

    /// All expression ids in ascending id order.
    pub fn expression_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| match n {
                IrNode::Expr(e) => Some(e.id),
                IrNode::Op(_) => None,
            })
            .collect()
    }

    /// Operator ids matching `pred`, in ascending id order.
    pub fn find_ops_that_match(&self, pred: impl Fn(&OperatorNode) -> bool) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| match n {
                IrNode::Op(op) if pred(op) => Some(op.id),
                _ => None,
            })
            .collect()
    }

    pub fn operator_count(&self) -> usize {
        self.operator_ids().len()
    }

    /// Root expression ids referenced directly by an operator's payload.
    pub fn op_expr_roots(&self, op: NodeId) -> Vec<NodeId> {
        let node = self.operator(op);
        match &node.kind {
            OperatorKind::MemorySource {
                time_start,
                time_stop,
                ..
            } => time_start.iter().chain(time_stop.iter()).copied().collect(),
            OperatorKind::Map { exprs, .. } => exprs.iter().map(|ce| ce.expr).collect(),
            OperatorKind::Filter { predicate } => vec![*predicate],
            OperatorKind::BlockingAgg { groups, aggregates } => groups
                .iter()
                .copied()
                .chain(aggregates.iter().map(|ce| ce.expr))
                .collect(),
            OperatorKind::GroupBy { groups } => groups.clone(),
            OperatorKind::Join {
                left_on, right_on, ..
            } => left_on.iter().chain(right_on.iter()).copied().collect(),
            OperatorKind::Rolling {
                window_size,
                groups,
                ..
            } => std::iter::once(*window_size)
                .chain(groups.iter().copied())
                .collect(),
            OperatorKind::UdtfSource { arg_values, .. } => arg_values.clone(),
            OperatorKind::MemorySink { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::Union { .. }
            | OperatorKind::Drop { .. } => Vec::new(),
        }
    }

    /// Transitive closure of expression ids reachable from `roots` through
    /// function arguments and tuple items.
    pub fn expr_closure(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            if let Some(e) = self.maybe_expr(id) {
                match &e.kind {
                    ExprKind::Func { args, .. } => stack.extend(args.iter().copied()),
                    ExprKind::Tuple { items } => stack.extend(items.iter().copied()),
                    _ => {}
                }
            }
        }
        out
    }

    /// Every expression id reachable from some live operator.
    pub fn live_expr_nodes(&self) -> HashSet<NodeId> {
        let mut live = HashSet::new();
        for op in self.operator_ids() {
            for id in self.expr_closure(&self.op_expr_roots(op)) {
                live.insert(id);
            }
        }
        live
    }

    /// The operator whose payload reaches `expr_id`, if any.
    pub fn containing_op(&self, expr_id: NodeId) -> Option<NodeId> {
        for op in self.operator_ids() {
            if self
                .expr_closure(&self.op_expr_roots(op))
                .contains(&expr_id)
            {
                return Some(op);
            }
        }
        None
    }

    /// Swap every reference to expression `old` for `new` within `op`'s
    /// payload (roots and nested function/tuple arguments).
    pub fn replace_expr_in_op(&mut self, op: NodeId, old: NodeId, new: NodeId) {
        // Nested references first: walk the closure and patch args.
        let closure = self.expr_closure(&self.op_expr_roots(op));
        for id in closure {
            if id == old {
                continue;
            }
            if let Some(IrNode::Expr(e)) = self.nodes.get_mut(&id) {
                match &mut e.kind {
                    ExprKind::Func { args, .. } => {
                        for arg in args {
                            if *arg == old {
                                *arg = new;
                            }
                        }
                    }
                    ExprKind::Tuple { items } => {
                        for item in items {
                            if *item == old {
                                *item = new;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        let node = self.operator_mut(op);
        let swap = |id: &mut NodeId| {
            if *id == old {
                *id = new;
            }
        };
        match &mut node.kind {
            OperatorKind::MemorySource {
                time_start,
                time_stop,
                ..
            } => {
                if let Some(t) = time_start {
                    swap(t);
                }
                if let Some(t) = time_stop {
                    swap(t);
                }
            }
            OperatorKind::Map { exprs, .. } => exprs.iter_mut().for_each(|ce| swap(&mut ce.expr)),
            OperatorKind::Filter { predicate } => swap(predicate),
            OperatorKind::BlockingAgg { groups, aggregates } => {
                groups.iter_mut().for_each(&swap);
                aggregates.iter_mut().for_each(|ce| swap(&mut ce.expr));
            }
            OperatorKind::GroupBy { groups } => groups.iter_mut().for_each(&swap),
            OperatorKind::Join {
                left_on, right_on, ..
            } => {
                left_on.iter_mut().for_each(&swap);
                right_on.iter_mut().for_each(&swap);
            }
            OperatorKind::Rolling {
                window_size,
                groups,
                ..
            } => {
                swap(window_size);
                groups.iter_mut().for_each(&swap);
            }
            OperatorKind::UdtfSource { arg_values, .. } => arg_values.iter_mut().for_each(&swap),
            OperatorKind::MemorySink { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::Union { .. }
            | OperatorKind::Drop { .. } => {}
        }
    }

    /// Deep-copy a column expression for merging into another operator.
    pub fn deep_copy_expr(&mut self, expr_id: NodeId) -> NodeId {
        let node = self.expr(expr_id).clone();
        let kind = match node.kind {
            ExprKind::Func { name, args, arg_types } => {
                let copied: Vec<NodeId> =
                    args.iter().map(|&a| self.deep_copy_expr(a)).collect();
                ExprKind::Func {
                    name,
                    args: copied,
                    arg_types,
                }
            }
            ExprKind::Tuple { items } => {
                let copied: Vec<NodeId> =
                    items.iter().map(|&i| self.deep_copy_expr(i)).collect();
                ExprKind::Tuple { items: copied }
            }
            other => other,
        };
        let id = self.add_expr(node.span, kind);
        {
            let copy = self.expr_mut(id);
            copy.data_type = node.data_type;
            copy.annotation = node.annotation;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_source() -> (IrGraph, NodeId) {
        let mut g = IrGraph::new();
        let src = g
            .add_operator(
                SourceSpan::UNKNOWN,
                OperatorKind::MemorySource {
                    table: "cpu".to_string(),
                    column_names: vec![],
                    time_start: None,
                    time_stop: None,
                    time_start_ns: None,
                    time_stop_ns: None,
                },
                &[],
            )
            .expect("source");
        (g, src)
    }

    #[test]
    fn add_operator_wires_dag_edges() {
        let (mut g, src) = graph_with_source();
        let pred = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Boolean(true)),
        );
        let filter = g
            .add_operator(SourceSpan::UNKNOWN, OperatorKind::Filter { predicate: pred }, &[src])
            .expect("filter");
        assert_eq!(g.parents_of(filter), &[src]);
        assert_eq!(g.children_of(src), &[filter]);
        // Expressions never join the DAG.
        assert!(!g.dag().has_node(pred));
    }

    #[test]
    fn wrong_arity_is_a_compile_error() {
        let (mut g, src) = graph_with_source();
        let err = g
            .add_operator(
                SourceSpan::new(3, 7),
                OperatorKind::Limit { n: 10 },
                &[src, src],
            )
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Limit expects 1 parent(s), got 2"), "{msg}");
    }

    #[test]
    fn literal_expressions_resolve_immediately() {
        let (mut g, _) = graph_with_source();
        let lit = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(42)),
        );
        assert_eq!(g.expr(lit).data_type, Some(DataType::Int64));
    }

    #[test]
    fn set_relation_is_once_only() {
        let (mut g, src) = graph_with_source();
        g.set_relation(src, Relation::new());
        assert!(g.operator(src).is_relation_set());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            g.set_relation(src, Relation::new());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn delete_orphans_in_subtree_stops_at_shared_nodes() {
        let (mut g, src_a) = graph_with_source();
        let src_b = g
            .add_operator(
                SourceSpan::UNKNOWN,
                OperatorKind::MemorySource {
                    table: "mem".to_string(),
                    column_names: vec![],
                    time_start: None,
                    time_stop: None,
                    time_start_ns: None,
                    time_stop_ns: None,
                },
                &[],
            )
            .expect("source b");
        let union = g
            .add_operator(
                SourceSpan::UNKNOWN,
                OperatorKind::Union {
                    column_mappings: vec![],
                },
                &[src_a, src_b],
            )
            .expect("union");
        let sink = g
            .add_operator(
                SourceSpan::UNKNOWN,
                OperatorKind::MemorySink {
                    name: "out".to_string(),
                },
                &[union],
            )
            .expect("sink");

        g.delete_orphans_in_subtree(src_a);
        // The union still has src_b feeding it, so it and the sink survive.
        assert!(!g.has_node(src_a));
        assert!(g.has_node(union));
        assert!(g.has_node(sink));

        g.delete_orphans_in_subtree(src_b);
        assert_eq!(g.operator_count(), 0);
    }

    #[test]
    fn expr_closure_follows_func_args() {
        let (mut g, _) = graph_with_source();
        let a = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(1)),
        );
        let b = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(2)),
        );
        let f = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Func {
                name: "add".to_string(),
                args: vec![a, b],
                arg_types: vec![],
            },
        );
        let closure = g.expr_closure(&[f]);
        assert_eq!(closure.len(), 3);
        assert!(closure.contains(&a) && closure.contains(&b) && closure.contains(&f));
    }

    #[test]
    fn containing_op_finds_payload_owner() {
        let (mut g, src) = graph_with_source();
        let col = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Column {
                name: "cpu0".to_string(),
                parent_idx: 0,
            },
        );
        let map = g
            .add_operator(
                SourceSpan::UNKNOWN,
                OperatorKind::Map {
                    exprs: vec![ColumnExpr {
                        name: "cpu0".to_string(),
                        expr: col,
                    }],
                    keep_input_columns: false,
                },
                &[src],
            )
            .expect("map");
        assert_eq!(g.containing_op(col), Some(map));
        let stray = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(0)),
        );
        assert_eq!(g.containing_op(stray), None);
    }

    #[test]
    fn deep_copy_is_structurally_fresh() {
        let (mut g, _) = graph_with_source();
        let a = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(1)),
        );
        let f = g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Func {
                name: "abs".to_string(),
                args: vec![a],
                arg_types: vec![],
            },
        );
        let copy = g.deep_copy_expr(f);
        assert_ne!(copy, f);
        match &g.expr(copy).kind {
            ExprKind::Func { args, .. } => assert_ne!(args[0], a),
            other => panic!("expected func, got {other:?}"),
        }
    }
}
