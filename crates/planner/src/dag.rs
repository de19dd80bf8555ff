use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use qv_common::NodeId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Generic node-id DAG with ordered forward/reverse adjacency.
///
/// Backbone structure for the IR graph (operator dependencies) and the
/// distributed coordination graph.
///
/// Guarantees:
/// - every present node has entries (possibly empty) in both adjacency maps;
/// - an edge `(a, b)` exists iff `b` is in `forward[a]` and `a` is in
///   `reverse[b]`;
/// - adjacency order is insertion order and survives edge replacement.
///
/// Duplicate node insertion, edges between missing nodes, and cycles where
/// acyclicity is required are programming errors and panic.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: BTreeSet<NodeId>,
    forward: HashMap<NodeId, Vec<NodeId>>,
    reverse: HashMap<NodeId, Vec<NodeId>>,
}

/// Wire form of one DAG node: explicit, sorted parent/child id lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNodeProto {
    pub id: NodeId,
    pub sorted_parents: Vec<NodeId>,
    pub sorted_children: Vec<NodeId>,
}

/// Wire form of a whole DAG, nodes listed in topological order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagProto {
    pub nodes: Vec<DagNodeProto>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a DAG from its wire form.
    pub fn from_proto(proto: &DagProto) -> Self {
        let mut dag = Self::new();
        for node in &proto.nodes {
            dag.add_node(node.id);
        }
        for node in &proto.nodes {
            for &child in &node.sorted_children {
                dag.forward.get_mut(&node.id).unwrap().push(child);
            }
            for &parent in &node.sorted_parents {
                dag.reverse.get_mut(&node.id).unwrap().push(parent);
            }
        }
        dag
    }

    pub fn add_node(&mut self, node: NodeId) {
        assert!(!self.has_node(node), "node {node} already exists");
        self.nodes.insert(node);
        self.forward.insert(node, Vec::new());
        self.reverse.insert(node, Vec::new());
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Delete a node and every edge touching it. Absent nodes are a warned
    /// no-op.
    pub fn delete_node(&mut self, node: NodeId) {
        if !self.has_node(node) {
            warn!(node = %node, "delete_node: node does not exist");
            return;
        }
        self.delete_parent_edges(node);
        self.delete_dependent_edges(node);
        self.forward.remove(&node);
        self.reverse.remove(&node);
        self.nodes.remove(&node);
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        assert!(self.has_node(from), "from node {from} does not exist");
        assert!(self.has_node(to), "to node {to} does not exist");
        self.forward.get_mut(&from).unwrap().push(to);
        self.reverse.get_mut(&to).unwrap().push(from);
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.forward
            .get(&from)
            .is_some_and(|children| children.contains(&to))
    }

    pub fn delete_edge(&mut self, from: NodeId, to: NodeId) {
        if let Some(children) = self.forward.get_mut(&from) {
            if let Some(pos) = children.iter().position(|&c| c == to) {
                children.remove(pos);
            }
        }
        if let Some(parents) = self.reverse.get_mut(&to) {
            if let Some(pos) = parents.iter().position(|&p| p == from) {
                parents.remove(pos);
            }
        }
    }

    /// Swap `old_child` for `new_child` in `parent`'s child list, keeping its
    /// position, and fix up the reverse entries on both children.
    pub fn replace_child_edge(&mut self, parent: NodeId, old_child: NodeId, new_child: NodeId) {
        assert!(self.has_node(parent), "parent node {parent} does not exist");
        assert!(
            self.has_node(old_child),
            "old child node {old_child} does not exist"
        );
        assert!(
            self.has_node(new_child),
            "new child node {new_child} does not exist"
        );
        for child in self.forward.get_mut(&parent).unwrap() {
            if *child == old_child {
                *child = new_child;
            }
        }
        let parents = self.reverse.get_mut(&old_child).unwrap();
        if let Some(pos) = parents.iter().position(|&p| p == parent) {
            parents.remove(pos);
        }
        self.reverse.get_mut(&new_child).unwrap().push(parent);
    }

    /// Swap `old_parent` for `new_parent` in `child`'s parent list, keeping
    /// its position, and fix up the forward entries on both parents.
    pub fn replace_parent_edge(&mut self, child: NodeId, old_parent: NodeId, new_parent: NodeId) {
        assert!(self.has_node(child), "child node {child} does not exist");
        assert!(
            self.has_node(old_parent),
            "old parent node {old_parent} does not exist"
        );
        assert!(
            self.has_node(new_parent),
            "new parent node {new_parent} does not exist"
        );
        for parent in self.reverse.get_mut(&child).unwrap() {
            if *parent == old_parent {
                *parent = new_parent;
            }
        }
        let children = self.forward.get_mut(&old_parent).unwrap();
        if let Some(pos) = children.iter().position(|&c| c == child) {
            children.remove(pos);
        }
        self.forward.get_mut(&new_parent).unwrap().push(child);
    }

    /// Ordered children of `node`.
    pub fn children_of(&self, node: NodeId) -> &[NodeId] {
        self.forward.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ordered parents of `node`.
    pub fn parents_of(&self, node: NodeId) -> &[NodeId] {
        self.reverse.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kahn's algorithm. Panics when the graph contains a cycle.
    pub fn topological_sort(&self) -> Vec<NodeId> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut visited_count: HashMap<NodeId, usize> = HashMap::new();

        for &node in &self.nodes {
            if self.reverse[&node].is_empty() {
                queue.push_back(node);
            }
        }
        assert!(
            !queue.is_empty(),
            "no nodes without incoming edges, likely a cycle"
        );

        while let Some(front) = queue.pop_front() {
            ordered.push(front);
            for &dep in &self.forward[&front] {
                let count = visited_count.entry(dep).or_insert(0);
                *count += 1;
                if *count == self.reverse[&dep].len() {
                    queue.push_back(dep);
                }
            }
        }

        assert_eq!(ordered.len(), self.nodes.len(), "cycle detected in graph");
        ordered
    }

    /// Every node reachable from `node` through forward edges.
    ///
    /// Iterative three-color DFS; revisiting an in-progress node panics.
    pub fn transitive_deps_from(&self, node: NodeId) -> HashSet<NodeId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        enum Visit {
            Started(NodeId),
            Complete(NodeId),
        }

        let mut stack = vec![Visit::Started(node)];
        let mut deps = HashSet::new();
        let mut colors: HashMap<NodeId, Color> = HashMap::new();

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Complete(n) => {
                    colors.insert(n, Color::Black);
                }
                Visit::Started(n) => {
                    colors.insert(n, Color::Gray);
                    stack.push(Visit::Complete(n));
                    for &dep in self.children_of(n) {
                        let color = colors.get(&dep).copied().unwrap_or(Color::White);
                        assert!(color != Color::Gray, "cycle found");
                        if color == Color::White {
                            stack.push(Visit::Started(dep));
                            deps.insert(dep);
                        }
                    }
                }
            }
        }
        deps
    }

    /// Nodes with no edges in either direction.
    pub fn orphans(&self) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .copied()
            .filter(|n| self.forward[n].is_empty() && self.reverse[n].is_empty())
            .collect()
    }

    /// Partition the graph into its weakly-connected components, discovered
    /// by merging forward reachability from every zero-indegree source.
    pub fn independent_graphs(&self) -> Vec<BTreeSet<NodeId>> {
        let sources: Vec<NodeId> = self
            .nodes
            .iter()
            .copied()
            .filter(|n| self.reverse[n].is_empty())
            .collect();
        assert!(
            self.nodes.is_empty() || !sources.is_empty(),
            "no nodes without incoming edges, likely a cycle"
        );

        // Union-find keyed by node id; each source seeds a set and sets merge
        // whenever two sources reach a common node.
        let mut set_parents: HashMap<NodeId, NodeId> = HashMap::new();

        fn find(set_parents: &mut HashMap<NodeId, NodeId>, mut n: NodeId) -> NodeId {
            while set_parents[&n] != n {
                let grand = set_parents[&set_parents[&n]];
                set_parents.insert(n, grand);
                n = grand;
            }
            n
        }

        for &source in &sources {
            set_parents.insert(source, source);
            let mut queue = VecDeque::from([source]);
            while let Some(front) = queue.pop_front() {
                for &child in self.children_of(front) {
                    if set_parents.contains_key(&child) {
                        let a = find(&mut set_parents, front);
                        let b = find(&mut set_parents, child);
                        if a != b {
                            set_parents.insert(a, b);
                        }
                    } else {
                        let root = find(&mut set_parents, front);
                        set_parents.insert(child, root);
                        queue.push_back(child);
                    }
                }
            }
        }
        assert_eq!(
            set_parents.len(),
            self.nodes.len(),
            "cycle detected in graph"
        );

        let mut components: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for &node in &self.nodes {
            let root = find(&mut set_parents, node);
            components.entry(root).or_default().insert(node);
        }
        let mut out: Vec<BTreeSet<NodeId>> = components.into_values().collect();
        out.sort_by_key(|set| set.iter().next().copied());
        out
    }

    /// Serialize to the wire form, nodes in topological order with sorted
    /// adjacency lists.
    pub fn to_proto(&self) -> DagProto {
        self.to_proto_ignoring(&HashSet::new())
    }

    /// [`Dag::to_proto`] with `ignore_ids` nodes (and edges touching them)
    /// dropped.
    pub fn to_proto_ignoring(&self, ignore_ids: &HashSet<NodeId>) -> DagProto {
        let mut proto = DagProto::default();
        for id in self.topological_sort() {
            if ignore_ids.contains(&id) {
                continue;
            }
            let mut sorted_parents: Vec<NodeId> = self.reverse[&id]
                .iter()
                .copied()
                .filter(|p| !ignore_ids.contains(p))
                .collect();
            sorted_parents.sort();
            let mut sorted_children: Vec<NodeId> = self.forward[&id]
                .iter()
                .copied()
                .filter(|c| !ignore_ids.contains(c))
                .collect();
            sorted_children.sort();
            proto.nodes.push(DagNodeProto {
                id,
                sorted_parents,
                sorted_children,
            });
        }
        proto
    }

    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for &node in &self.nodes {
            let children = self.forward[&node]
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("{{{node}}} : [{children}]\n"));
        }
        out
    }

    fn delete_parent_edges(&mut self, to: NodeId) {
        let parents = std::mem::take(self.reverse.get_mut(&to).unwrap());
        for parent in parents {
            let forward = self.forward.get_mut(&parent).unwrap();
            if let Some(pos) = forward.iter().position(|&c| c == to) {
                forward.remove(pos);
            }
        }
    }

    fn delete_dependent_edges(&mut self, from: NodeId) {
        let children = std::mem::take(self.forward.get_mut(&from).unwrap());
        for child in children {
            let reverse = self.reverse.get_mut(&child).unwrap();
            if let Some(pos) = reverse.iter().position(|&p| p == from) {
                reverse.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> NodeId {
        NodeId(v)
    }

    fn diamond() -> Dag {
        // 5 -> {8, 3}, 8 -> 6, 3 -> 6
        let mut dag = Dag::new();
        for v in [5, 8, 3, 6] {
            dag.add_node(id(v));
        }
        dag.add_edge(id(5), id(8));
        dag.add_edge(id(5), id(3));
        dag.add_edge(id(8), id(6));
        dag.add_edge(id(3), id(6));
        dag
    }

    #[test]
    fn topological_sort_respects_edges() {
        let dag = diamond();
        let order = dag.topological_sort();
        assert_eq!(order.len(), 4);
        let pos =
            |v: u64| order.iter().position(|&n| n == id(v)).expect("node in order");
        assert!(pos(5) < pos(8));
        assert!(pos(5) < pos(3));
        assert!(pos(8) < pos(6));
        assert!(pos(3) < pos(6));
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_add_node_panics() {
        let mut dag = Dag::new();
        dag.add_node(id(1));
        dag.add_node(id(1));
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn topological_sort_panics_on_cycle() {
        let mut dag = Dag::new();
        dag.add_node(id(0));
        dag.add_node(id(1));
        dag.add_node(id(2));
        dag.add_edge(id(0), id(1));
        dag.add_edge(id(1), id(2));
        dag.add_edge(id(2), id(1));
        dag.topological_sort();
    }

    #[test]
    fn delete_node_removes_incident_edges() {
        let mut dag = diamond();
        dag.delete_node(id(8));
        assert!(!dag.has_node(id(8)));
        for node in dag.nodes() {
            assert!(!dag.children_of(node).contains(&id(8)));
            assert!(!dag.parents_of(node).contains(&id(8)));
        }
        assert!(dag.has_edge(id(5), id(3)));
        assert!(dag.has_edge(id(3), id(6)));
    }

    #[test]
    fn delete_missing_node_is_noop() {
        let mut dag = diamond();
        dag.delete_node(id(99));
        assert_eq!(dag.len(), 4);
    }

    #[test]
    fn replace_child_edge_preserves_position() {
        let mut dag = diamond();
        dag.add_node(id(10));
        dag.replace_child_edge(id(5), id(8), id(10));
        assert_eq!(dag.children_of(id(5)), &[id(10), id(3)]);
        assert_eq!(dag.parents_of(id(10)), &[id(5)]);
        assert!(dag.parents_of(id(8)).is_empty());
    }

    #[test]
    fn replace_parent_edge_preserves_position() {
        let mut dag = diamond();
        dag.add_node(id(10));
        dag.replace_parent_edge(id(6), id(8), id(10));
        assert_eq!(dag.parents_of(id(6)), &[id(10), id(3)]);
        assert_eq!(dag.children_of(id(10)), &[id(6)]);
        assert!(dag.children_of(id(8)).is_empty());
    }

    #[test]
    fn transitive_deps_from_source() {
        let dag = diamond();
        let deps = dag.transitive_deps_from(id(5));
        assert_eq!(deps, HashSet::from([id(8), id(3), id(6)]));
        assert!(dag.transitive_deps_from(id(6)).is_empty());
    }

    #[test]
    fn orphans_have_no_edges() {
        let mut dag = diamond();
        dag.add_node(id(20));
        assert_eq!(dag.orphans(), BTreeSet::from([id(20)]));
    }

    #[test]
    fn independent_graphs_partitions_nodes() {
        let mut dag = diamond();
        dag.add_node(id(20));
        dag.add_node(id(21));
        dag.add_edge(id(20), id(21));

        let graphs = dag.independent_graphs();
        assert_eq!(graphs.len(), 2);
        let all: BTreeSet<NodeId> = graphs.iter().flatten().copied().collect();
        assert_eq!(all.len(), dag.len());
        // No edge crosses component boundaries.
        for component in &graphs {
            for &node in component {
                for &child in dag.children_of(node) {
                    assert!(component.contains(&child));
                }
            }
        }
    }

    #[test]
    fn merged_sources_share_one_component() {
        let dag = diamond();
        let graphs = dag.independent_graphs();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].len(), 4);
    }

    #[test]
    fn proto_round_trip_preserves_adjacency() {
        let mut dag = Dag::new();
        for v in [1, 2, 3, 4] {
            dag.add_node(id(v));
        }
        dag.add_edge(id(1), id(2));
        dag.add_edge(id(1), id(3));
        dag.add_edge(id(2), id(4));
        dag.add_edge(id(3), id(4));

        let proto = dag.to_proto();
        let restored = Dag::from_proto(&proto);
        assert_eq!(restored.len(), dag.len());
        for node in dag.nodes() {
            assert_eq!(restored.children_of(node), dag.children_of(node));
            assert_eq!(restored.parents_of(node), dag.parents_of(node));
        }
    }

    #[test]
    fn proto_ignore_set_drops_nodes_and_edges() {
        let dag = diamond();
        let proto = dag.to_proto_ignoring(&HashSet::from([id(8)]));
        assert_eq!(proto.nodes.len(), 3);
        for node in &proto.nodes {
            assert_ne!(node.id, id(8));
            assert!(!node.sorted_children.contains(&id(8)));
            assert!(!node.sorted_parents.contains(&id(8)));
        }
    }
}
