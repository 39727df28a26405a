//! End-to-end pipeline tests: orchestrator + in-process agent workers over
//! a shared working directory, with scripted mock providers.

use std::sync::Arc;
use std::time::Duration;

use relay_agents::tools::NoopDispatcher;
use relay_agents::worker::{AgentWorker, WorkerContext};
use relay_core::config::{AgentSpec, Config, OrchestratorConfig};
use relay_core::paths::WorkDir;
use relay_core::types::{TaskSource, TaskStatus};
use relay_daemon::channel::{ChannelBus, ChannelEvent};
use relay_daemon::orchestrator::Orchestrator;
use relay_llm::breaker::{BreakerConfig, CircuitBreaker};
use relay_llm::provider::{KeyRing, MockProvider};
use relay_llm::resilient::ResilientClient;
use relay_llm::retry::RetryConfig;
use relay_llm::router::{ProviderEntry, ProviderRouter, RouteStrategy};

fn test_config() -> Config {
    let mut config = Config::default();
    for (id, role, restricted) in [
        ("planner", "Strategic planner. Decompose or answer directly.", false),
        ("executor", "Task executor. Do the work.", false),
        ("reviewer", "Peer reviewer. Score outputs.", true),
    ] {
        config.agents.push(AgentSpec {
            id: id.into(),
            role: role.into(),
            model: "mock-model".into(),
            fallback_models: Vec::new(),
            skills: Vec::new(),
            tools: Vec::new(),
            reputation: 100,
            restricted,
            soul: None,
        });
    }
    // Short idle-exit so workers wind down quickly after the run.
    config.worker.max_idle_cycles = 2;
    config
}

fn mock_router(provider: MockProvider) -> Arc<ProviderRouter> {
    let client = ResilientClient::new(
        "mock",
        Arc::new(provider),
        Arc::new(KeyRing::new(vec!["test-key".into()])),
        CircuitBreaker::new("mock", BreakerConfig::default()),
        RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        },
    );
    Arc::new(ProviderRouter::new(
        vec![ProviderEntry::new("mock", client).with_models(vec!["mock-model".into()])],
        RouteStrategy::Preference,
    ))
}

fn spawn_worker(
    config: &Config,
    workdir: &WorkDir,
    agent_id: &str,
    provider: MockProvider,
) -> tokio::task::JoinHandle<()> {
    let ctx = WorkerContext::build(
        config,
        workdir.clone(),
        agent_id,
        mock_router(provider),
        Arc::new(NoopDispatcher),
    )
    .unwrap();
    tokio::spawn(async move {
        AgentWorker::new(ctx).run().await.unwrap();
    })
}

fn lgtm_json() -> &'static str {
    r#"{"dimensions": {"accuracy": 9, "completeness": 8, "technical": 9,
        "calibration": 8, "efficiency": 8}, "verdict": "LGTM", "items": [],
        "confidence": 0.9}"#
}

/// Scenario: direct answer. A short question routes to a single simple
/// planner task; the planner's text is the final result and no sub-tasks
/// appear.
#[tokio::test(flavor = "multi_thread")]
async fn direct_answer_route() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(dir.path());
    workdir.ensure_layout().unwrap();
    let config = test_config();

    let planner = spawn_worker(
        &config,
        &workdir,
        "planner",
        MockProvider::new().with_text("TCP is a reliable, ordered transport protocol."),
    );

    let channel = ChannelBus::new();
    let events = channel.subscribe();
    let orchestrator = Orchestrator::new(
        &workdir,
        OrchestratorConfig {
            task_timeout: 30,
            poll_interval: 1,
            progress_interval: 30,
        },
        channel,
    );

    let task_id = orchestrator
        .submit("What is TCP?", TaskSource::new("test", "What is TCP?"))
        .unwrap();
    let outcome = orchestrator.wait(&task_id, None).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(outcome.result.contains("transport protocol"));

    // No sub-tasks were created.
    let board = relay_core::board::TaskBoard::new(&workdir);
    assert_eq!(board.list().unwrap().len(), 1);

    // Exactly one terminal complete event reached the channel.
    let completes = events
        .try_iter()
        .filter(|e| matches!(e, ChannelEvent::Complete { .. }))
        .count();
    assert_eq!(completes, 1);

    planner.await.unwrap();
}

/// Scenario: happy pipeline. The planner decomposes into two sub-tasks, the
/// executor runs both, the reviewer LGTMs both, and the planner synthesizes
/// the close-out into the root result.
#[tokio::test(flavor = "multi_thread")]
async fn happy_pipeline_with_review_and_closeout() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(dir.path());
    workdir.ensure_layout().unwrap();
    let config = test_config();

    let plan = r#"Two steps are needed.

```subtask
{"objective": "Write a Python script that prints 1..10", "complexity": "normal"}
```

```subtask
{"objective": "Run the script and capture its output", "complexity": "normal"}
```
"#;

    let planner = spawn_worker(
        &config,
        &workdir,
        "planner",
        MockProvider::new()
            .with_text(plan)
            .with_text("Final answer: the script was written and printed 1 through 10."),
    );
    let executor = spawn_worker(
        &config,
        &workdir,
        "executor",
        MockProvider::new()
            .with_text("for i in range(1, 11): print(i)")
            .with_text("1\n2\n3\n4\n5\n6\n7\n8\n9\n10"),
    );
    let reviewer = spawn_worker(
        &config,
        &workdir,
        "reviewer",
        MockProvider::new().with_text(lgtm_json()).with_text(lgtm_json()),
    );

    let orchestrator = Orchestrator::new(
        &workdir,
        OrchestratorConfig {
            task_timeout: 60,
            poll_interval: 1,
            progress_interval: 30,
        },
        ChannelBus::new(),
    );

    let task_id = orchestrator
        .submit(
            "Write a Python script that prints 1..10 and run it.",
            TaskSource::new("test", "Write a Python script that prints 1..10 and run it."),
        )
        .unwrap();
    let outcome = orchestrator.wait(&task_id, None).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(outcome.result.contains("Final answer"));

    let board = relay_core::board::TaskBoard::new(&workdir);
    let tasks = board.list().unwrap();
    assert_eq!(tasks.len(), 3, "root + two sub-tasks");
    let children: Vec<_> = tasks
        .iter()
        .filter(|t| t.parent_id.as_deref() == Some(task_id.as_str()))
        .collect();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.status, TaskStatus::Completed);
        assert!(child.critique.is_some(), "reviewer scored each sub-task");
    }

    for handle in [planner, executor, reviewer] {
        handle.await.unwrap();
    }
}

/// Scenario: one revision round. The reviewer returns NEEDS_WORK once; the
/// executor re-claims via the critique path, revises, and the rework cap
/// auto-completes the second submission. The close-out still proceeds.
#[tokio::test(flavor = "multi_thread")]
async fn needs_work_drives_one_revision_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(dir.path());
    workdir.ensure_layout().unwrap();
    let config = test_config();

    let plan = "```subtask\n{\"objective\": \"Draft the summary\", \"complexity\": \"normal\"}\n```";
    let needs_work = r#"{"dimensions": {"accuracy": 4, "completeness": 7, "technical": 7,
        "calibration": 7, "efficiency": 7}, "verdict": "NEEDS_WORK",
        "items": [{"dimension": "accuracy", "issue": "numbers are off", "suggestion": "recount"},
                  {"dimension": "completeness", "issue": "missing section", "suggestion": "add it"}],
        "confidence": 0.8}"#;

    let planner = spawn_worker(
        &config,
        &workdir,
        "planner",
        MockProvider::new()
            .with_text(plan)
            .with_text("Here is the corrected summary, integrated."),
    );
    let executor = spawn_worker(
        &config,
        &workdir,
        "executor",
        MockProvider::new()
            .with_text("a rough stub")
            .with_text("a careful, corrected summary"),
    );
    let reviewer = spawn_worker(
        &config,
        &workdir,
        "reviewer",
        MockProvider::new().with_text(needs_work),
    );

    let orchestrator = Orchestrator::new(
        &workdir,
        OrchestratorConfig {
            task_timeout: 60,
            poll_interval: 1,
            progress_interval: 30,
        },
        ChannelBus::new(),
    );

    let task_id = orchestrator
        .submit(
            "Write a summary of the quarterly numbers.",
            TaskSource::new("test", "Write a summary of the quarterly numbers."),
        )
        .unwrap();
    let outcome = orchestrator.wait(&task_id, None).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    let board = relay_core::board::TaskBoard::new(&workdir);
    let child = board
        .list()
        .unwrap()
        .into_iter()
        .find(|t| t.parent_id.as_deref() == Some(task_id.as_str()))
        .unwrap();
    assert_eq!(child.status, TaskStatus::Completed);
    assert_eq!(child.critique_round, 1, "exactly one revision round");
    assert_eq!(child.result.as_deref(), Some("a careful, corrected summary"));

    for handle in [planner, executor, reviewer] {
        handle.await.unwrap();
    }
}

/// Scenario: user cancellation. Cancelling the root transitions every
/// non-terminal descendant to cancelled and the channel sees one terminal
/// complete event carrying the cancelled status.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_cascades_to_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(dir.path());
    workdir.ensure_layout().unwrap();
    let config = test_config();

    // Planner decomposes, but no executor ever runs the children.
    let plan = "```subtask\n{\"objective\": \"Long running job\", \"complexity\": \"normal\"}\n```";
    let planner = spawn_worker(
        &config,
        &workdir,
        "planner",
        MockProvider::new().with_text(plan),
    );

    let channel = ChannelBus::new();
    let events = channel.subscribe();
    let orchestrator = Orchestrator::new(
        &workdir,
        OrchestratorConfig {
            task_timeout: 60,
            poll_interval: 1,
            progress_interval: 30,
        },
        channel,
    );

    let task_id = orchestrator
        .submit(
            "Analyze the dataset and write a report.",
            TaskSource::new("test", "Analyze the dataset and write a report."),
        )
        .unwrap();

    // Wait until the decomposition exists, then cancel.
    let board = relay_core::board::TaskBoard::new(&workdir);
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        let children = board.children_of(&task_id).unwrap();
        if !children.is_empty() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "planner never decomposed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let outcome = orchestrator.cancel(&task_id).unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);

    for task in board.list().unwrap() {
        assert!(
            task.is_terminal(),
            "task {} left non-terminal after cancel",
            task.id
        );
    }

    let completes = events
        .try_iter()
        .filter(|e| matches!(e, ChannelEvent::Complete { status, .. } if status == "cancelled"))
        .count();
    assert_eq!(completes, 1);

    planner.await.unwrap();
}
