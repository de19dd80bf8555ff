use std::collections::HashMap;

use qv_common::{PlannerConfig, SourceSpan};
use qv_planner::{
    Column, ColumnExpr, Compiler, CompilerState, DataType, ExprKind, FuncRegistry, IrGraph,
    JoinKind, LiteralValue, MetadataCatalog, OperatorKind, Relation, Rule, SemanticType,
};

const SPAN: SourceSpan = SourceSpan::UNKNOWN;

fn relation_of(cols: &[(&str, DataType)]) -> Relation {
    Relation::from_columns(cols.iter().map(|(n, t)| Column::new(*n, *t)).collect())
}

fn state_with(tables: &[(&str, &[(&str, DataType)])]) -> CompilerState {
    let mut catalog = HashMap::new();
    for (name, cols) in tables {
        catalog.insert(name.to_string(), relation_of(cols));
    }
    let mut registry = FuncRegistry::with_builtins();
    registry.register_scalar("upid_to_pod_name", vec![DataType::Uint128], DataType::String);
    registry.register_scalar(
        "upid_to_service_name",
        vec![DataType::Uint128],
        DataType::String,
    );
    CompilerState::new(
        catalog,
        registry,
        MetadataCatalog::with_defaults(),
        1_000_000_000_000,
    )
}

fn cpu_state() -> CompilerState {
    state_with(&[(
        "cpu",
        &[
            ("count", DataType::Int64),
            ("cpu0", DataType::Float64),
            ("cpu1", DataType::Float64),
            ("cpu2", DataType::Float64),
        ],
    )])
}

fn mem_source(graph: &mut IrGraph, table: &str) -> qv_common::NodeId {
    graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySource {
                table: table.to_string(),
                column_names: vec![],
                time_start: None,
                time_stop: None,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source")
}

fn mem_sink(graph: &mut IrGraph, parent: qv_common::NodeId, name: &str) -> qv_common::NodeId {
    graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySink {
                name: name.to_string(),
            },
            &[parent],
        )
        .expect("sink")
}

fn col_ref(graph: &mut IrGraph, name: &str) -> qv_common::NodeId {
    graph.add_expr(
        SPAN,
        ExprKind::Column {
            name: name.to_string(),
            parent_idx: 0,
        },
    )
}

fn col_ref_of(graph: &mut IrGraph, parent_idx: usize, name: &str) -> qv_common::NodeId {
    graph.add_expr(
        SPAN,
        ExprKind::Column {
            name: name.to_string(),
            parent_idx,
        },
    )
}

fn compile(graph: &mut IrGraph, state: &CompilerState) -> qv_common::Result<()> {
    Compiler::new(PlannerConfig::default()).compile(graph, state)
}

// ---------------------------------------------------------------------------
// Source + relation resolution
// ---------------------------------------------------------------------------

#[test]
fn source_to_sink_resolves_catalog_relation() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let sink = mem_sink(&mut graph, source, "out");
    compile(&mut graph, &state).expect("compile");
    let relation = graph.operator(sink).relation().expect("sink relation");
    assert_eq!(relation.col_names(), vec!["count", "cpu0", "cpu1", "cpu2"]);
}

#[test]
fn missing_table_is_a_compile_error_naming_it() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "not_a_table");
    mem_sink(&mut graph, source, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("Table 'not_a_table' not found."),
        "{err}"
    );
}

#[test]
fn source_column_subset_preserves_requested_order() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySource {
                table: "cpu".to_string(),
                column_names: vec!["cpu1".to_string(), "count".to_string()],
                time_start: None,
                time_stop: None,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source");
    let sink = mem_sink(&mut graph, source, "out");
    compile(&mut graph, &state).expect("compile");
    assert_eq!(
        graph.operator(sink).relation().unwrap().col_names(),
        vec!["cpu1", "count"]
    );
}

#[test]
fn missing_source_columns_reported_as_set() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySource {
                table: "cpu".to_string(),
                column_names: vec!["zz".to_string(), "aa".to_string()],
                time_start: None,
                time_stop: None,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source");
    mem_sink(&mut graph, source, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("Columns {aa,zz} are missing"),
        "{err}"
    );
}

#[test]
fn unknown_function_errors_with_its_name() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let arg = col_ref(&mut graph, "count");
    let call = graph.add_expr(
        SPAN,
        ExprKind::Func {
            name: "no_such_fn".to_string(),
            args: vec![arg],
            arg_types: vec![],
        },
    );
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "x".to_string(),
                    expr: call,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    mem_sink(&mut graph, map, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string()
            .contains("Could not find function 'no_such_fn' with arguments [INT64]."),
        "{err}"
    );
}

#[test]
fn non_boolean_filter_predicate_is_rejected() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let predicate = col_ref(&mut graph, "count");
    let filter = graph
        .add_operator(SPAN, OperatorKind::Filter { predicate }, &[source])
        .expect("filter");
    mem_sink(&mut graph, filter, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string()
            .contains("Expected Boolean for Filter expression, got INT64"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Union
// ---------------------------------------------------------------------------

fn union_graph(state_tables: &[(&str, &[(&str, DataType)])]) -> (CompilerState, IrGraph) {
    let state = state_with(state_tables);
    let mut graph = IrGraph::new();
    let a = mem_source(&mut graph, state_tables[0].0);
    let b = mem_source(&mut graph, state_tables[1].0);
    let union = graph
        .add_operator(
            SPAN,
            OperatorKind::Union {
                column_mappings: vec![],
            },
            &[a, b],
        )
        .expect("union");
    mem_sink(&mut graph, union, "out");
    (state, graph)
}

#[test]
fn union_unifies_reordered_relations_to_first_input_order() {
    let t1: &[(&str, DataType)] = &[
        ("count", DataType::Int64),
        ("cpu0", DataType::Float64),
        ("cpu1", DataType::Float64),
        ("cpu2", DataType::Float64),
    ];
    let t2: &[(&str, DataType)] = &[
        ("cpu1", DataType::Float64),
        ("count", DataType::Int64),
        ("cpu2", DataType::Float64),
        ("cpu0", DataType::Float64),
    ];
    let (state, mut graph) = union_graph(&[("t1", t1), ("t2", t2)]);
    compile(&mut graph, &state).expect("compile");
    let union = graph.find_ops_that_match(|op| matches!(op.kind, OperatorKind::Union { .. }))[0];
    let relation = graph.operator(union).relation().unwrap();
    assert_eq!(relation.col_names(), vec!["count", "cpu0", "cpu1", "cpu2"]);
    // Second input's mapping points at its own (reordered) positions.
    if let OperatorKind::Union { column_mappings } = &graph.operator(union).kind {
        assert_eq!(column_mappings[0], vec![0, 1, 2, 3]);
        assert_eq!(column_mappings[1], vec![1, 3, 0, 2]);
    } else {
        panic!("expected union");
    }
}

#[test]
fn union_column_count_mismatch_names_the_check() {
    let t1: &[(&str, DataType)] = &[("count", DataType::Int64), ("cpu0", DataType::Float64)];
    let t2: &[(&str, DataType)] = &[("count", DataType::Int64)];
    let (state, mut graph) = union_graph(&[("t1", t1), ("t2", t2)]);
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(err.to_string().contains("column count mismatch"), "{err}");
}

#[test]
fn union_type_mismatch_names_the_column() {
    let t1: &[(&str, DataType)] = &[("count", DataType::Int64), ("cpu0", DataType::Float64)];
    let t2: &[(&str, DataType)] = &[("count", DataType::Int64), ("cpu0", DataType::Int64)];
    let (state, mut graph) = union_graph(&[("t1", t1), ("t2", t2)]);
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("type mismatch for column 'cpu0'"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

fn join_graph(how: JoinKind, left_table: &str, right_table: &str) -> (IrGraph, qv_common::NodeId) {
    let mut graph = IrGraph::new();
    let left = mem_source(&mut graph, left_table);
    let right = mem_source(&mut graph, right_table);
    let lkey = col_ref_of(&mut graph, 0, "key");
    let rkey = col_ref_of(&mut graph, 1, "key");
    let join = graph
        .add_operator(
            SPAN,
            OperatorKind::Join {
                how,
                specified_right: false,
                left_on: vec![lkey],
                right_on: vec![rkey],
                suffixes: ("_x".to_string(), "_y".to_string()),
                output_columns: vec![],
            },
            &[left, right],
        )
        .expect("join");
    mem_sink(&mut graph, join, "out");
    (graph, join)
}

#[test]
fn join_suffixes_only_colliding_columns() {
    let state = state_with(&[
        ("lt", &[("key", DataType::String), ("lval", DataType::Int64)]),
        ("rt", &[("key", DataType::String), ("rval", DataType::Float64)]),
    ]);
    let (mut graph, join) = join_graph(JoinKind::Inner, "lt", "rt");
    compile(&mut graph, &state).expect("compile");
    let relation = graph.operator(join).relation().unwrap();
    assert_eq!(relation.col_names(), vec!["key_x", "lval", "key_y", "rval"]);
    assert_eq!(relation.column(0).data_type, DataType::String);
    assert_eq!(relation.column(1).data_type, DataType::Int64);
    assert_eq!(relation.column(2).data_type, DataType::String);
    assert_eq!(relation.column(3).data_type, DataType::Float64);
}

#[test]
fn join_duplicate_after_suffixing_is_an_error() {
    let state = state_with(&[
        (
            "lt",
            &[("key", DataType::String), ("key_y", DataType::Int64)],
        ),
        ("rt", &[("key", DataType::String), ("rval", DataType::Float64)]),
    ]);
    let (mut graph, _) = join_graph(JoinKind::Inner, "lt", "rt");
    let err = compile(&mut graph, &state).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("duplicate column 'key_y'"), "{msg}");
    assert!(msg.contains("('_x', '_y')"), "{msg}");
}

#[test]
fn right_join_is_rewritten_to_left_with_user_column_order() {
    let state = state_with(&[
        ("lt", &[("key", DataType::String), ("lval", DataType::Int64)]),
        ("rt", &[("key", DataType::String), ("rval", DataType::Float64)]),
    ]);
    let (mut graph, join) = join_graph(JoinKind::Right, "lt", "rt");
    let sources = graph.find_ops_that_match(|op| op.kind.is_source());
    let (left_src, right_src) = (sources[0], sources[1]);
    compile(&mut graph, &state).expect("compile");

    // Internally left, parents swapped, but output order is the user's.
    match &graph.operator(join).kind {
        OperatorKind::Join {
            how,
            specified_right,
            ..
        } => {
            assert_eq!(*how, JoinKind::Left);
            assert!(specified_right);
        }
        other => panic!("expected join, got {other:?}"),
    }
    assert_eq!(graph.parents_of(join), &[right_src, left_src]);
    let relation = graph.operator(join).relation().unwrap();
    assert_eq!(relation.col_names(), vec!["key_x", "lval", "key_y", "rval"]);
}

// ---------------------------------------------------------------------------
// GroupBy merging
// ---------------------------------------------------------------------------

#[test]
fn groupby_merges_into_blocking_agg() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let key = col_ref(&mut graph, "count");
    let groupby = graph
        .add_operator(SPAN, OperatorKind::GroupBy { groups: vec![key] }, &[source])
        .expect("groupby");
    let arg = col_ref(&mut graph, "cpu0");
    let mean = graph.add_expr(
        SPAN,
        ExprKind::Func {
            name: "mean".to_string(),
            args: vec![arg],
            arg_types: vec![],
        },
    );
    let agg = graph
        .add_operator(
            SPAN,
            OperatorKind::BlockingAgg {
                groups: vec![],
                aggregates: vec![ColumnExpr {
                    name: "mean_cpu".to_string(),
                    expr: mean,
                }],
            },
            &[groupby],
        )
        .expect("agg");
    mem_sink(&mut graph, agg, "out");
    compile(&mut graph, &state).expect("compile");

    assert!(graph
        .find_ops_that_match(|op| matches!(op.kind, OperatorKind::GroupBy { .. }))
        .is_empty());
    assert_eq!(graph.parents_of(agg), &[source]);
    let relation = graph.operator(agg).relation().unwrap();
    assert_eq!(relation.col_names(), vec!["count", "mean_cpu"]);
    assert_eq!(relation.column(1).data_type, DataType::Float64);
}

#[test]
fn two_consumers_of_one_groupby_get_fresh_group_columns() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let key = col_ref(&mut graph, "count");
    let groupby = graph
        .add_operator(SPAN, OperatorKind::GroupBy { groups: vec![key] }, &[source])
        .expect("groupby");
    let mut aggs = Vec::new();
    for name in ["a1", "a2"] {
        let arg = col_ref(&mut graph, "cpu0");
        let mean = graph.add_expr(
            SPAN,
            ExprKind::Func {
                name: "mean".to_string(),
                args: vec![arg],
                arg_types: vec![],
            },
        );
        let agg = graph
            .add_operator(
                SPAN,
                OperatorKind::BlockingAgg {
                    groups: vec![],
                    aggregates: vec![ColumnExpr {
                        name: name.to_string(),
                        expr: mean,
                    }],
                },
                &[groupby],
            )
            .expect("agg");
        mem_sink(&mut graph, agg, name);
        aggs.push(agg);
    }
    compile(&mut graph, &state).expect("compile");

    let mut group_exprs = Vec::new();
    for &agg in &aggs {
        match &graph.operator(agg).kind {
            OperatorKind::BlockingAgg { groups, .. } => {
                assert_eq!(groups.len(), 1);
                group_exprs.push(groups[0]);
            }
            other => panic!("expected agg, got {other:?}"),
        }
    }
    // Deep copies, not shared pointers.
    assert_ne!(group_exprs[0], group_exprs[1]);
}

#[test]
fn groupby_without_aggregate_is_an_error() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let key = col_ref(&mut graph, "count");
    let groupby = graph
        .add_operator(SPAN, OperatorKind::GroupBy { groups: vec![key] }, &[source])
        .expect("groupby");
    let limit = graph
        .add_operator(SPAN, OperatorKind::Limit { n: 10 }, &[groupby])
        .expect("limit");
    mem_sink(&mut graph, limit, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("'groupby' must be followed by an agg"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Map fusion
// ---------------------------------------------------------------------------

fn two_maps_graph(
    child_refs_parent_output: bool,
) -> (CompilerState, IrGraph, qv_common::NodeId) {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let a_expr = col_ref(&mut graph, "count");
    let parent = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "a".to_string(),
                    expr: a_expr,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("parent map");
    let b_expr = if child_refs_parent_output {
        let a_ref = col_ref(&mut graph, "a");
        let one = graph.add_expr(SPAN, ExprKind::Literal(LiteralValue::Int64(1)));
        graph.add_expr(
            SPAN,
            ExprKind::Func {
                name: "add".to_string(),
                args: vec![a_ref, one],
                arg_types: vec![],
            },
        )
    } else {
        let one = graph.add_expr(SPAN, ExprKind::Literal(LiteralValue::Int64(1)));
        let two = graph.add_expr(SPAN, ExprKind::Literal(LiteralValue::Int64(2)));
        graph.add_expr(
            SPAN,
            ExprKind::Func {
                name: "add".to_string(),
                args: vec![one, two],
                arg_types: vec![],
            },
        )
    };
    let child = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "b".to_string(),
                    expr: b_expr,
                }],
                keep_input_columns: true,
            },
            &[parent],
        )
        .expect("child map");
    mem_sink(&mut graph, child, "out");
    (state, graph, child)
}

#[test]
fn consecutive_maps_fuse_parent_list_then_child_list() {
    let (state, mut graph, child) = two_maps_graph(false);
    compile(&mut graph, &state).expect("compile");
    let maps = graph.find_ops_that_match(|op| matches!(op.kind, OperatorKind::Map { .. }));
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0], child);
    match &graph.operator(child).kind {
        OperatorKind::Map {
            exprs,
            keep_input_columns,
        } => {
            let names: Vec<&str> = exprs.iter().map(|ce| ce.name.as_str()).collect();
            assert_eq!(names, vec!["a", "b"]);
            assert!(!keep_input_columns);
        }
        other => panic!("expected map, got {other:?}"),
    }
}

#[test]
fn fusion_blocked_when_child_references_parent_output() {
    let (state, mut graph, _) = two_maps_graph(true);
    compile(&mut graph, &state).expect("compile");
    let maps = graph.find_ops_that_match(|op| matches!(op.kind, OperatorKind::Map { .. }));
    assert_eq!(maps.len(), 2);
}

// ---------------------------------------------------------------------------
// Column pruning
// ---------------------------------------------------------------------------

#[test]
fn prune_unused_columns_minimizes_source_column_set() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let out_expr = col_ref(&mut graph, "count");
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "out".to_string(),
                    expr: out_expr,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    mem_sink(&mut graph, map, "result");
    compile(&mut graph, &state).expect("compile");

    match &graph.operator(source).kind {
        OperatorKind::MemorySource { column_names, .. } => {
            assert_eq!(column_names, &vec!["count".to_string()]);
        }
        other => panic!("expected source, got {other:?}"),
    }
    assert_eq!(
        graph.operator(source).relation().unwrap().col_names(),
        vec!["count"]
    );

    // Idempotence: a converged graph reports no further change.
    use qv_planner::PruneUnusedColumnsRule;
    assert!(!PruneUnusedColumnsRule
        .execute(&mut graph)
        .expect("prune re-run"));
}

#[test]
fn cleanup_rules_are_idempotent_at_fixed_point() {
    let (state, mut graph, _) = two_maps_graph(false);
    compile(&mut graph, &state).expect("compile");
    use qv_planner::{
        CleanUpStrayIRNodesRule, CombineConsecutiveMapsRule, PruneUnconnectedOperatorsRule,
        PruneUnusedColumnsRule, UniqueSinkNameRule,
    };
    assert!(!CombineConsecutiveMapsRule.execute(&mut graph).unwrap());
    assert!(!PruneUnusedColumnsRule.execute(&mut graph).unwrap());
    assert!(!CleanUpStrayIRNodesRule.execute(&mut graph).unwrap());
    assert!(!PruneUnconnectedOperatorsRule.execute(&mut graph).unwrap());
    assert!(!UniqueSinkNameRule.execute(&mut graph).unwrap());
}

// ---------------------------------------------------------------------------
// Output shaping
// ---------------------------------------------------------------------------

#[test]
fn duplicate_sink_names_get_numbered_suffixes() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let s1 = mem_sink(&mut graph, source, "out");
    let s2 = mem_sink(&mut graph, source, "out");
    let s3 = mem_sink(&mut graph, source, "out");
    let s4 = mem_sink(&mut graph, source, "other");
    compile(&mut graph, &state).expect("compile");
    let name_of = |id| match &graph.operator(id).kind {
        OperatorKind::MemorySink { name } => name.clone(),
        _ => unreachable!(),
    };
    assert_eq!(name_of(s1), "out");
    assert_eq!(name_of(s2), "out_1");
    assert_eq!(name_of(s3), "out_2");
    assert_eq!(name_of(s4), "other");
}

#[test]
fn row_cap_inserts_limit_above_sink() {
    let state = cpu_state().with_max_output_rows(100);
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let sink = mem_sink(&mut graph, source, "out");
    compile(&mut graph, &state).expect("compile");
    let parent = graph.parents_of(sink)[0];
    match &graph.operator(parent).kind {
        OperatorKind::Limit { n } => assert_eq!(*n, 100),
        other => panic!("expected limit above sink, got {other:?}"),
    }
}

#[test]
fn row_cap_only_lowers_existing_limits() {
    let state = cpu_state().with_max_output_rows(100);

    // A looser limit is tightened to the cap.
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let loose = graph
        .add_operator(SPAN, OperatorKind::Limit { n: 500 }, &[source])
        .expect("limit");
    let sink = mem_sink(&mut graph, loose, "out");
    compile(&mut graph, &state).expect("compile");
    match &graph.operator(graph.parents_of(sink)[0]).kind {
        OperatorKind::Limit { n } => assert_eq!(*n, 100),
        other => panic!("expected limit, got {other:?}"),
    }

    // A tighter limit is left alone.
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let tight = graph
        .add_operator(SPAN, OperatorKind::Limit { n: 7 }, &[source])
        .expect("limit");
    let sink = mem_sink(&mut graph, tight, "out");
    compile(&mut graph, &state).expect("compile");
    match &graph.operator(graph.parents_of(sink)[0]).kind {
        OperatorKind::Limit { n } => assert_eq!(*n, 7),
        other => panic!("expected limit, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Time conversion
// ---------------------------------------------------------------------------

#[test]
fn relative_time_strings_resolve_against_now() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let start = graph.add_expr(
        SPAN,
        ExprKind::Literal(LiteralValue::String("-30s".to_string())),
    );
    let stop = graph.add_expr(
        SPAN,
        ExprKind::Literal(LiteralValue::String("-10s".to_string())),
    );
    let source = graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySource {
                table: "cpu".to_string(),
                column_names: vec![],
                time_start: Some(start),
                time_stop: Some(stop),
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source");
    mem_sink(&mut graph, source, "out");
    compile(&mut graph, &state).expect("compile");
    match &graph.operator(source).kind {
        OperatorKind::MemorySource {
            time_start_ns,
            time_stop_ns,
            ..
        } => {
            assert_eq!(*time_start_ns, Some(1_000_000_000_000 - 30_000_000_000));
            assert_eq!(*time_stop_ns, Some(1_000_000_000_000 - 10_000_000_000));
        }
        other => panic!("expected source, got {other:?}"),
    }
}

#[test]
fn compile_time_arithmetic_folds_in_time_expressions() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let base = graph.add_expr(SPAN, ExprKind::Literal(LiteralValue::Int64(1_000)));
    let scale = graph.add_expr(SPAN, ExprKind::Literal(LiteralValue::Int64(3)));
    let start = graph.add_expr(
        SPAN,
        ExprKind::Func {
            name: "multiply".to_string(),
            args: vec![base, scale],
            arg_types: vec![],
        },
    );
    let source = graph
        .add_operator(
            SPAN,
            OperatorKind::MemorySource {
                table: "cpu".to_string(),
                column_names: vec![],
                time_start: Some(start),
                time_stop: None,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source");
    mem_sink(&mut graph, source, "out");
    compile(&mut graph, &state).expect("compile");
    match &graph.operator(source).kind {
        OperatorKind::MemorySource { time_start_ns, .. } => {
            assert_eq!(*time_start_ns, Some(3_000));
        }
        other => panic!("expected source, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Rolling windows
// ---------------------------------------------------------------------------

fn metrics_state() -> CompilerState {
    state_with(&[(
        "metrics",
        &[
            ("time_", DataType::Time64Ns),
            ("count", DataType::Int64),
            ("cpu0", DataType::Float64),
        ],
    )])
}

fn rolling_over(
    graph: &mut IrGraph,
    parent: qv_common::NodeId,
    window: &str,
) -> qv_common::NodeId {
    let window_size = graph.add_expr(
        SPAN,
        ExprKind::Literal(LiteralValue::String(window.to_string())),
    );
    graph
        .add_operator(
            SPAN,
            OperatorKind::Rolling {
                window_col: "time_".to_string(),
                window_size,
                window_size_ns: None,
                groups: vec![],
            },
            &[parent],
        )
        .expect("rolling")
}

#[test]
fn rolling_window_size_resolves_to_nanoseconds() {
    let state = metrics_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "metrics");
    let rolling = rolling_over(&mut graph, source, "10s");
    let sink = mem_sink(&mut graph, rolling, "out");
    compile(&mut graph, &state).expect("compile");
    match &graph.operator(rolling).kind {
        OperatorKind::Rolling { window_size_ns, .. } => {
            assert_eq!(*window_size_ns, Some(10_000_000_000));
        }
        other => panic!("expected rolling, got {other:?}"),
    }
    // Windows assign rows to groups; the relation passes through unchanged.
    assert_eq!(
        graph.operator(sink).relation().unwrap().col_names(),
        vec!["time_", "count", "cpu0"]
    );
}

#[test]
fn non_positive_window_size_is_rejected() {
    let state = metrics_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "metrics");
    let rolling = rolling_over(&mut graph, source, "0s");
    mem_sink(&mut graph, rolling, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("Window size must be positive"),
        "{err}"
    );
}

#[test]
fn groupby_merges_into_rolling_window() {
    let state = metrics_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "metrics");
    let key = col_ref(&mut graph, "count");
    let groupby = graph
        .add_operator(SPAN, OperatorKind::GroupBy { groups: vec![key] }, &[source])
        .expect("groupby");
    let rolling = rolling_over(&mut graph, groupby, "5s");
    mem_sink(&mut graph, rolling, "out");
    compile(&mut graph, &state).expect("compile");

    assert!(graph
        .find_ops_that_match(|op| matches!(op.kind, OperatorKind::GroupBy { .. }))
        .is_empty());
    assert_eq!(graph.parents_of(rolling), &[source]);
    match &graph.operator(rolling).kind {
        OperatorKind::Rolling { groups, .. } => assert_eq!(groups.len(), 1),
        other => panic!("expected rolling, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Drop
// ---------------------------------------------------------------------------

#[test]
fn drop_removes_named_columns_from_relation() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let dropper = graph
        .add_operator(
            SPAN,
            OperatorKind::Drop {
                columns: vec!["cpu1".to_string(), "cpu2".to_string()],
            },
            &[source],
        )
        .expect("drop");
    let sink = mem_sink(&mut graph, dropper, "out");
    compile(&mut graph, &state).expect("compile");
    assert_eq!(
        graph.operator(sink).relation().unwrap().col_names(),
        vec!["count", "cpu0"]
    );
    // Column pruning propagated the narrowed set down to the source.
    match &graph.operator(source).kind {
        OperatorKind::MemorySource { column_names, .. } => {
            assert_eq!(column_names, &vec!["count".to_string(), "cpu0".to_string()]);
        }
        other => panic!("expected source, got {other:?}"),
    }
}

#[test]
fn dropping_unknown_column_is_an_error() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let dropper = graph
        .add_operator(
            SPAN,
            OperatorKind::Drop {
                columns: vec!["nope".to_string()],
            },
            &[source],
        )
        .expect("drop");
    mem_sink(&mut graph, dropper, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("Column 'nope' not found in relation"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

fn upid_state() -> CompilerState {
    let mut catalog = HashMap::new();
    catalog.insert(
        "http_events".to_string(),
        Relation::from_columns(vec![
            Column::new("upid", DataType::Uint128).with_semantic(SemanticType::Upid),
            Column::new("latency", DataType::Int64),
        ]),
    );
    let mut registry = FuncRegistry::with_builtins();
    registry.register_scalar("upid_to_pod_name", vec![DataType::Uint128], DataType::String);
    registry.register_scalar(
        "upid_to_service_name",
        vec![DataType::Uint128],
        DataType::String,
    );
    CompilerState::new(
        catalog,
        registry,
        MetadataCatalog::with_defaults(),
        1_000_000_000_000,
    )
}

#[test]
fn metadata_reference_converts_to_udf_over_key_column() {
    let state = upid_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "http_events");
    let md = graph.add_expr(
        SPAN,
        ExprKind::Metadata {
            name: "pod_name".to_string(),
            property: None,
        },
    );
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "pod".to_string(),
                    expr: md,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    let sink = mem_sink(&mut graph, map, "out");
    compile(&mut graph, &state).expect("compile");

    match &graph.operator(map).kind {
        OperatorKind::Map { exprs, .. } => {
            let expr = graph.expr(exprs[0].expr);
            match &expr.kind {
                ExprKind::Func { name, args, .. } => {
                    assert_eq!(name, "upid_to_pod_name");
                    match &graph.expr(args[0]).kind {
                        ExprKind::Column { name, .. } => assert_eq!(name, "upid"),
                        other => panic!("expected key column, got {other:?}"),
                    }
                }
                other => panic!("expected conversion func, got {other:?}"),
            }
        }
        other => panic!("expected map, got {other:?}"),
    }
    let relation = graph.operator(sink).relation().unwrap();
    assert_eq!(relation.col_names(), vec!["pod"]);
    assert_eq!(relation.column(0).data_type, DataType::String);
    assert_eq!(relation.column(0).semantic_type, SemanticType::PodName);
}

#[test]
fn metadata_without_key_column_reports_requirements() {
    let state = state_with(&[("bare", &[("count", DataType::Int64)])]);
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "bare");
    let md = graph.add_expr(
        SPAN,
        ExprKind::Metadata {
            name: "pod_name".to_string(),
            property: None,
        },
    );
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "pod".to_string(),
                    expr: md,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    mem_sink(&mut graph, map, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Need one of [upid]"), "{msg}");
    assert!(msg.contains("[count]"), "{msg}");
}

#[test]
fn unknown_metadata_property_is_an_error() {
    let state = upid_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "http_events");
    let md = graph.add_expr(
        SPAN,
        ExprKind::Metadata {
            name: "rack_name".to_string(),
            property: None,
        },
    );
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "rack".to_string(),
                    expr: md,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    mem_sink(&mut graph, map, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string()
            .contains("Specified metadata value 'rack_name' is not properly handled."),
        "{err}"
    );
}

#[test]
fn reserved_metadata_prefix_is_rejected_in_user_columns() {
    let state = cpu_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "cpu");
    let expr = col_ref(&mut graph, "count");
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "_attr_pod_name".to_string(),
                    expr,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    mem_sink(&mut graph, map, "out");
    let err = compile(&mut graph, &state).unwrap_err();
    assert!(
        err.to_string().contains("'_attr_' prefix is reserved"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Annotation propagation
// ---------------------------------------------------------------------------

#[test]
fn annotations_survive_pure_renames() {
    let state = upid_state();
    let mut graph = IrGraph::new();
    let source = mem_source(&mut graph, "http_events");
    let rename = col_ref(&mut graph, "upid");
    let map = graph
        .add_operator(
            SPAN,
            OperatorKind::Map {
                exprs: vec![ColumnExpr {
                    name: "process".to_string(),
                    expr: rename,
                }],
                keep_input_columns: false,
            },
            &[source],
        )
        .expect("map");
    let sink = mem_sink(&mut graph, map, "out");
    compile(&mut graph, &state).expect("compile");
    let relation = graph.operator(sink).relation().unwrap();
    assert_eq!(relation.column(0).name, "process");
    assert_eq!(relation.column(0).semantic_type, SemanticType::Upid);
}

#[test]
fn union_drops_divergent_annotations() {
    // One input renames an annotated column into `id`, the other produces
    // `id` from a plain value; the union output must carry no annotation.
    let mut catalog = HashMap::new();
    catalog.insert(
        "tagged".to_string(),
        Relation::from_columns(vec![
            Column::new("id", DataType::Uint128).with_semantic(SemanticType::Upid)
        ]),
    );
    catalog.insert(
        "plain".to_string(),
        Relation::from_columns(vec![Column::new("id", DataType::Uint128)]),
    );
    let state = CompilerState::new(
        catalog,
        FuncRegistry::with_builtins(),
        MetadataCatalog::with_defaults(),
        1_000_000_000_000,
    );
    let mut graph = IrGraph::new();
    let a = mem_source(&mut graph, "tagged");
    let b = mem_source(&mut graph, "plain");
    let union = graph
        .add_operator(
            SPAN,
            OperatorKind::Union {
                column_mappings: vec![],
            },
            &[a, b],
        )
        .expect("union");
    let sink = mem_sink(&mut graph, union, "out");
    compile(&mut graph, &state).expect("compile");
    let relation = graph.operator(sink).relation().unwrap();
    assert_eq!(relation.column(0).semantic_type, SemanticType::None);
}
