//! End-to-end runtime tests: supersteps, interrupts, recovery, time travel.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use valgraph_checkpoint::{
    CheckpointConfig, CheckpointSource, CheckpointStore, InMemoryCheckpointStore, ListFilter,
};
use valgraph_core::{
    update_state, Command, CompiledGraph, EndReason, GraphBuilder, GraphRunner, NodeContext,
    NodeFuture, NodeOptions, NodeOutput, ResumeValue, RetryPolicy, RunInput, RunOutcome,
    RunnerConfig, RuntimeEvent, StateSchema, ValueType,
};

type State = HashMap<String, Value>;

fn writes(pairs: &[(&str, Value)]) -> NodeOutput {
    let mut update = HashMap::new();
    for (channel, value) in pairs {
        update.insert(channel.to_string(), value.clone());
    }
    NodeOutput::Update(update)
}

fn runner_for(
    graph: CompiledGraph,
    store: Arc<dyn CheckpointStore>,
) -> (GraphRunner, mpsc::UnboundedReceiver<RuntimeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let runner = GraphRunner::new(Arc::new(graph), store, tx);
    (runner, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn event_types(events: &[RuntimeEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

#[tokio::test]
async fn test_happy_path_events_and_checkpoints() {
    let graph = GraphBuilder::new(StateSchema::new().overwrite("message", ValueType::String))
        .add_node("a", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(NodeOutput::empty()) }) as NodeFuture
        })
        .set_entry("a")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, mut rx) = runner_for(graph, store.clone());

    let mut input = HashMap::new();
    input.insert("message".to_string(), json!("hello"));
    let outcome = runner.run("t1", RunInput::Message(input)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let events = drain(&mut rx);
    assert_eq!(
        event_types(&events),
        vec!["lifecycle.start", "node.start", "node.end", "lifecycle.end"]
    );
    match events.last().unwrap() {
        RuntimeEvent::LifecycleEnd { reason, .. } => assert_eq!(*reason, EndReason::Complete),
        other => panic!("unexpected: {:?}", other),
    }

    // Two checkpoints: input plus the post-a superstep.
    let history = store.list("t1", &ListFilter::default()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].metadata.source, CheckpointSource::Loop);
    assert_eq!(history[1].metadata.source, CheckpointSource::Input);
}

#[tokio::test]
async fn test_two_step_pipeline_state_flow() {
    let schema = StateSchema::new()
        .overwrite("ticker", ValueType::String)
        .overwrite("fundamentals", ValueType::Object)
        .overwrite("verdict", ValueType::String);
    let graph = GraphBuilder::new(schema)
        .add_node("fetch", |state: State, _ctx: NodeContext| {
            Box::pin(async move {
                let ticker = state["ticker"].as_str().unwrap_or("?").to_string();
                Ok(writes(&[(
                    "fundamentals",
                    json!({"ticker": ticker, "pe": 14.2}),
                )]))
            }) as NodeFuture
        })
        .add_node("judge", |state: State, _ctx: NodeContext| {
            Box::pin(async move {
                let pe = state["fundamentals"]["pe"].as_f64().unwrap();
                let verdict = if pe < 20.0 { "buy" } else { "pass" };
                Ok(writes(&[("verdict", json!(verdict))]))
            }) as NodeFuture
        })
        .add_edge("fetch", "judge")
        .set_entry("fetch")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store.clone());

    let mut input = HashMap::new();
    input.insert("ticker".to_string(), json!("KO"));
    runner.run("t1", RunInput::Message(input)).await.unwrap();

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["verdict"], json!("buy"));
    assert!(tuple.checkpoint.next_nodes.is_empty());
}

#[tokio::test]
async fn test_interrupt_then_targeted_resume() {
    let side_effects = Arc::new(AtomicUsize::new(0));
    let body_runs = Arc::new(AtomicUsize::new(0));
    let guard = Arc::new(AtomicBool::new(false));

    let schema = StateSchema::new()
        .overwrite("amount", ValueType::Number)
        .overwrite("approval", ValueType::Any)
        .overwrite("result", ValueType::String);

    let effects = side_effects.clone();
    let runs = body_runs.clone();
    let fired = guard.clone();
    let graph = GraphBuilder::new(schema)
        .add_node("b", move |_state: State, ctx: NodeContext| {
            let effects = effects.clone();
            let runs = runs.clone();
            let fired = fired.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                // Externally visible side effect, idempotent by guard.
                if !fired.swap(true, Ordering::SeqCst) {
                    effects.fetch_add(1, Ordering::SeqCst);
                }
                let approved =
                    ctx.interrupt(json!({"kind": "approval", "amount": 100}), "approval")?;
                let result = if approved.as_bool().unwrap_or(false) {
                    "executed"
                } else {
                    "rejected"
                };
                Ok(writes(&[("result", json!(result))]))
            }) as NodeFuture
        })
        .set_entry("b")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, mut rx) = runner_for(graph, store.clone());

    // First call: suspends.
    let mut input = HashMap::new();
    input.insert("amount".to_string(), json!(100));
    let outcome = runner.run("t1", RunInput::Message(input)).await.unwrap();
    let records = match outcome {
        RunOutcome::Interrupted(records) => records,
        other => panic!("expected interrupt, got {:?}", other),
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload["kind"], json!("approval"));
    assert_eq!(records[0].payload["amount"], json!(100));

    let events = drain(&mut rx);
    assert_eq!(
        event_types(&events),
        vec![
            "lifecycle.start",
            "node.start",
            "interrupt.request",
            "lifecycle.end"
        ]
    );
    match &events[3] {
        RuntimeEvent::LifecycleEnd { reason, .. } => {
            assert_eq!(*reason, EndReason::Interrupted)
        }
        other => panic!("unexpected: {:?}", other),
    }

    // The suspended checkpoint carries the pending interrupt.
    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.metadata.source, CheckpointSource::Interrupt);
    assert_eq!(tuple.metadata.pending_interrupts.len(), 1);

    // Resume with the interrupt's id.
    let resume = ResumeValue::targeted(records[0].interrupt_id.clone(), json!(true));
    let outcome = runner
        .run("t1", RunInput::Resume(vec![resume]))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let events = drain(&mut rx);
    let types = event_types(&events);
    assert!(types.starts_with(&["lifecycle.start", "node.start", "node.end", "interrupt.resolved"]));
    assert_eq!(*types.last().unwrap(), "lifecycle.end");

    // Body ran twice, the guarded side effect fired once.
    assert_eq!(body_runs.load(Ordering::SeqCst), 2);
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["result"], json!("executed"));
    // The resume value landed on its channel too.
    assert_eq!(tuple.checkpoint.channel_values["approval"], json!(true));
    assert!(tuple.metadata.pending_interrupts.is_empty());
}

#[tokio::test]
async fn test_resume_unknown_interrupt_rejected() {
    let graph = GraphBuilder::new(StateSchema::new().overwrite("x", ValueType::Any))
        .add_node("gate", |_state: State, ctx: NodeContext| {
            Box::pin(async move {
                let value = ctx.interrupt(json!({"kind": "gate"}), "x")?;
                Ok(writes(&[("x", value)]))
            }) as NodeFuture
        })
        .set_entry("gate")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store);
    runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();

    let err = runner
        .run(
            "t1",
            RunInput::Resume(vec![ResumeValue::targeted("bogus", json!(1))]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_parallel_branches_one_interrupt() {
    let schema = StateSchema::new()
        .overwrite("out_p", ValueType::String)
        .overwrite("out_q", ValueType::Any)
        .overwrite("go", ValueType::Any);
    let graph = GraphBuilder::new(schema)
        .add_node("fan", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("go", json!(true))])) }) as NodeFuture
        })
        .add_node("p", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("out_p", json!("p done"))])) }) as NodeFuture
        })
        .add_node("q", |_state: State, ctx: NodeContext| {
            Box::pin(async move {
                let value = ctx.interrupt(json!({"kind": "confirm_q"}), "out_q")?;
                Ok(writes(&[("out_q", value)]))
            }) as NodeFuture
        })
        .add_edge("fan", "p")
        .add_edge("fan", "q")
        .set_entry("fan")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store.clone());

    let outcome = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();
    let records = match outcome {
        RunOutcome::Interrupted(records) => records,
        other => panic!("expected interrupt, got {:?}", other),
    };
    assert_eq!(records.len(), 1);

    // P's output is applied even though Q suspended the thread.
    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["out_p"], json!("p done"));
    assert!(!tuple.checkpoint.channel_values.contains_key("out_q"));

    let resume = ResumeValue::targeted(records[0].interrupt_id.clone(), json!("q confirmed"));
    let outcome = runner
        .run("t1", RunInput::Resume(vec![resume]))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["out_p"], json!("p done"));
    assert_eq!(
        tuple.checkpoint.channel_values["out_q"],
        json!("q confirmed")
    );
}

#[tokio::test]
async fn test_conflicting_overwrite_writers_terminate() {
    let schema = StateSchema::new()
        .overwrite("verdict", ValueType::String)
        .overwrite("go", ValueType::Any);
    let graph = GraphBuilder::new(schema)
        .add_node("fan", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("go", json!(true))])) }) as NodeFuture
        })
        .add_node("bull", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("verdict", json!("buy"))])) }) as NodeFuture
        })
        .add_node("bear", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("verdict", json!("sell"))])) }) as NodeFuture
        })
        .add_edge("fan", "bull")
        .add_edge("fan", "bear")
        .set_entry("fan")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store);
    let err = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn test_append_channel_merges_parallel_writers() {
    let schema = StateSchema::new()
        .append("opinions", ValueType::String)
        .overwrite("go", ValueType::Any);
    let graph = GraphBuilder::new(schema)
        .add_node("fan", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("go", json!(true))])) }) as NodeFuture
        })
        .add_node("zeta", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("opinions", json!("zeta says sell"))])) })
                as NodeFuture
        })
        .add_node("alpha", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("opinions", json!("alpha says buy"))])) })
                as NodeFuture
        })
        .add_edge("fan", "zeta")
        .add_edge("fan", "alpha")
        .set_entry("fan")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store.clone());
    runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    // Deterministic node-name order, not completion order.
    assert_eq!(
        tuple.checkpoint.channel_values["opinions"],
        json!(["alpha says buy", "zeta says sell"])
    );
}

#[tokio::test]
async fn test_retry_policy_absorbs_transient_failures() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let graph = GraphBuilder::new(StateSchema::new().overwrite("quote", ValueType::Number))
        .add_node_with(
            "fetch_quote",
            move |_state: State, _ctx: NodeContext| {
                let counter = counter.clone();
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(valgraph_core::GraphError::NodeError {
                            node: "fetch_quote".to_string(),
                            namespace: String::new(),
                            kind: "transient".to_string(),
                            message: "provider unavailable".to_string(),
                        })
                    } else {
                        Ok(writes(&[("quote", json!(42))]))
                    }
                }) as NodeFuture
            },
            NodeOptions::new().with_retry(
                RetryPolicy::new(3)
                    .with_initial_interval(0.01)
                    .with_jitter(false)
                    .with_retry_on(["transient"]),
            ),
        )
        .set_entry("fetch_quote")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store.clone());
    let outcome = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces() {
    let graph = GraphBuilder::new(StateSchema::new().overwrite("quote", ValueType::Number))
        .add_node_with(
            "fetch_quote",
            |_state: State, _ctx: NodeContext| {
                Box::pin(async move {
                    Err(valgraph_core::GraphError::NodeError {
                        node: "fetch_quote".to_string(),
                        namespace: String::new(),
                        kind: "transient".to_string(),
                        message: "still down".to_string(),
                    })
                }) as NodeFuture
            },
            NodeOptions::new().with_retry(
                RetryPolicy::new(2)
                    .with_initial_interval(0.01)
                    .with_jitter(false),
            ),
        )
        .set_entry("fetch_quote")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store);
    let err = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "retry_exhausted");
}

#[tokio::test]
async fn test_recursion_limit_leaves_checkpoint_intact() {
    // a and b ping-pong forever via goto.
    let graph = GraphBuilder::new(StateSchema::new().overwrite("n", ValueType::Number))
        .add_node("a", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(NodeOutput::Command(Command::new().with_goto("b"))) })
                as NodeFuture
        })
        .add_node("b", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(NodeOutput::Command(Command::new().with_goto("a"))) })
                as NodeFuture
        })
        .set_entry("a")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let runner = GraphRunner::new(Arc::new(graph), store.clone(), tx).with_config(RunnerConfig {
        recursion_limit: 4,
        ..Default::default()
    });

    let err = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "recursion_limit");

    // Four loop checkpoints plus the input one, all durable.
    let history = store.list("t1", &ListFilter::default()).await.unwrap();
    assert_eq!(history.len(), 5);
}

#[tokio::test]
async fn test_resume_empty_continues_after_restart() {
    // Stop after the first superstep by recursion limit, then resume with a
    // fresh runner sharing the store, as a restarted process would.
    fn pipeline() -> CompiledGraph {
        GraphBuilder::new(
            StateSchema::new()
                .overwrite("first", ValueType::Any)
                .overwrite("second", ValueType::Any),
        )
        .add_node("a", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("first", json!("a ran"))])) }) as NodeFuture
        })
        .add_node("b", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("second", json!("b ran"))])) }) as NodeFuture
        })
        .add_edge("a", "b")
        .set_entry("a")
        .compile()
        .unwrap()
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let first = GraphRunner::new(Arc::new(pipeline()), store.clone(), tx).with_config(
        RunnerConfig {
            recursion_limit: 1,
            ..Default::default()
        },
    );
    let err = first
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "recursion_limit");

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["first"], json!("a ran"));
    assert_eq!(tuple.checkpoint.next_nodes, vec!["b".to_string()]);

    // "Restart": new runner, same store, empty resume.
    let (runner, _rx2) = runner_for(pipeline(), store.clone());
    let outcome = runner
        .run("t1", RunInput::Resume(Vec::new()))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["second"], json!("b ran"));
}

#[tokio::test]
async fn test_time_travel_forks_history() {
    fn pipeline() -> CompiledGraph {
        GraphBuilder::new(
            StateSchema::new()
                .overwrite("channel_x", ValueType::String)
                .overwrite("echo", ValueType::String),
        )
        .add_node("seed", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("channel_x", json!("original"))])) }) as NodeFuture
        })
        .add_node("echo", |state: State, _ctx: NodeContext| {
            Box::pin(async move {
                let x = state["channel_x"].clone();
                Ok(writes(&[("echo", x)]))
            }) as NodeFuture
        })
        .add_edge("seed", "echo")
        .set_entry("seed")
        .compile()
        .unwrap()
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(pipeline(), store.clone());
    runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();

    let before = store.list("t1", &ListFilter::default()).await.unwrap();
    let completed_count = before.len();

    // Fork from the checkpoint where seed had run (next node: echo).
    let target = before
        .iter()
        .find(|t| t.checkpoint.next_nodes == vec!["echo".to_string()])
        .expect("post-seed checkpoint");
    let graph = pipeline();
    let mut values = HashMap::new();
    values.insert("channel_x".to_string(), json!("v"));
    update_state(
        &store,
        &graph,
        &CheckpointConfig::new("t1").with_checkpoint_id(target.checkpoint.id.clone()),
        values,
        None,
    )
    .await
    .unwrap();

    // Re-invoke: the branch continues from the forked checkpoint.
    let (runner, _rx) = runner_for(pipeline(), store.clone());
    let outcome = runner
        .run("t1", RunInput::Resume(Vec::new()))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["echo"], json!("v"));

    // Both branches live in history.
    let after = store.list("t1", &ListFilter::default()).await.unwrap();
    assert!(after.len() > completed_count);
    let update_count = after
        .iter()
        .filter(|t| t.metadata.source == CheckpointSource::Update)
        .count();
    assert_eq!(update_count, 1);
}

#[tokio::test]
async fn test_subgraph_runs_under_child_namespace() {
    let child = GraphBuilder::new(
        StateSchema::new()
            .overwrite("ticker", ValueType::String)
            .overwrite("sentiment", ValueType::String),
    )
    .add_node("score", |state: State, _ctx: NodeContext| {
        Box::pin(async move {
            let ticker = state["ticker"].as_str().unwrap_or("?").to_string();
            Ok(writes(&[("sentiment", json!(format!("{} bullish", ticker)))]))
        }) as NodeFuture
    })
    .set_entry("score")
    .compile()
    .unwrap();

    let parent = GraphBuilder::new(
        StateSchema::new()
            .overwrite("ticker", ValueType::String)
            .overwrite("sentiment", ValueType::String)
            .overwrite("summary", ValueType::String),
    )
    .add_subgraph("news", child, None, None, NodeOptions::new())
    .add_node("wrap", |state: State, _ctx: NodeContext| {
        Box::pin(async move {
            let sentiment = state["sentiment"].clone();
            Ok(writes(&[("summary", sentiment)]))
        }) as NodeFuture
    })
    .add_edge("news", "wrap")
    .set_entry("news")
    .compile()
    .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(parent, store.clone());
    let mut input = HashMap::new();
    input.insert("ticker".to_string(), json!("NVDA"));
    runner.run("t1", RunInput::Message(input)).await.unwrap();

    // Root state carries the projected subgraph output.
    let root = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        root.checkpoint.channel_values["summary"],
        json!("NVDA bullish")
    );

    // The subgraph wrote its own checkpoint chain under "news".
    let child_tuple = store
        .get_tuple(&CheckpointConfig::new("t1").with_namespace("news"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        child_tuple.checkpoint.channel_values["sentiment"],
        json!("NVDA bullish")
    );
}

#[tokio::test]
async fn test_subgraph_error_degrades_parent_node() {
    let child = GraphBuilder::new(StateSchema::new().overwrite("sentiment", ValueType::String))
        .add_node("score", |_state: State, _ctx: NodeContext| {
            Box::pin(async move {
                Err(valgraph_core::GraphError::node_error(
                    "score",
                    "news",
                    "feed unavailable",
                ))
            }) as NodeFuture
        })
        .set_entry("score")
        .compile()
        .unwrap();

    let on_error: Arc<valgraph_core::node::SubgraphErrorHandler> = Arc::new(|_error| {
        let mut update = HashMap::new();
        update.insert("sentiment".to_string(), json!("unavailable"));
        Some(update)
    });

    let parent = GraphBuilder::new(StateSchema::new().overwrite("sentiment", ValueType::String))
        .add_subgraph("news", child, None, Some(on_error), NodeOptions::new())
        .set_entry("news")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, mut rx) = runner_for(parent, store.clone());
    let outcome = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete));

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        tuple.checkpoint.channel_values["sentiment"],
        json!("unavailable")
    );

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RuntimeEvent::NodeEnd {
            status: valgraph_core::NodeStatus::Degraded,
            ..
        }
    )));
}

#[tokio::test]
async fn test_goto_overrides_static_routing() {
    let graph = GraphBuilder::new(StateSchema::new().overwrite("path", ValueType::String))
        .add_node("router", |_state: State, _ctx: NodeContext| {
            Box::pin(async move {
                Ok(NodeOutput::Command(
                    Command::new()
                        .with_write("path", json!("dynamic"))
                        .with_goto("special"),
                ))
            }) as NodeFuture
        })
        .add_node("normal", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("path", json!("normal"))])) }) as NodeFuture
        })
        .add_node("special", |_state: State, _ctx: NodeContext| {
            Box::pin(async move { Ok(writes(&[("path", json!("special"))])) }) as NodeFuture
        })
        .add_edge("router", "normal")
        .set_entry("router")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (runner, _rx) = runner_for(graph, store.clone());
    runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.checkpoint.channel_values["path"], json!("special"));
}

#[tokio::test]
async fn test_cancellation_writes_terminal_checkpoint() {
    let (handle, token) = valgraph_core::cancel_pair();
    let graph = GraphBuilder::new(StateSchema::new().overwrite("x", ValueType::Any))
        .add_node("slow", |_state: State, ctx: NodeContext| {
            Box::pin(async move {
                // Cooperative suspension point.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                ctx.check_cancelled()?;
                Ok(writes(&[("x", json!(1))]))
            }) as NodeFuture
        })
        .set_entry("slow")
        .compile()
        .unwrap();

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = GraphRunner::new(Arc::new(graph), store.clone(), tx).with_cancel(token);

    handle.cancel();
    let outcome = runner
        .run("t1", RunInput::Message(HashMap::new()))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));

    let events = drain(&mut rx);
    match events.last().unwrap() {
        RuntimeEvent::LifecycleEnd { reason, .. } => assert_eq!(*reason, EndReason::Cancelled),
        other => panic!("unexpected: {:?}", other),
    }

    let tuple = store
        .get_tuple(&CheckpointConfig::new("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tuple.metadata.source, CheckpointSource::Cancelled);
}
