//! End-to-end task lifecycle: submit → plan → execute → critique →
//! synthesize → deliver.
//!
//! `submit` classifies the request, creates the root planner task, and
//! anchors the original intent on the context bus. `wait` polls the board
//! until the root reaches a terminal state, emitting progress events along
//! the way; on timeout the root fails with `timeout` and cancellation
//! cascades over the whole tree. The planner worker owns sub-task
//! extraction and close-out synthesis - the orchestrator only observes.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::channel::{ChannelBus, ChannelEvent, TaskPhase};
use crate::router::{classify, RouteDecision};
use relay_agents::output::extract_file_markers;
use relay_bus::context::{ContextBus, ContextLayer, Provenance};
use relay_bus::wakeup::WakeupBus;
use relay_core::board::{BoardError, TaskBoard};
use relay_core::config::OrchestratorConfig;
use relay_core::paths::WorkDir;
use relay_core::store::StoreError;
use relay_core::subtasks::SubtaskMap;
use relay_core::types::{Complexity, NewTask, Task, TaskSource, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {task_id} timed out after {elapsed_secs}s")]
    Timeout { task_id: String, elapsed_secs: u64 },

    #[error("task not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Terminal outcome of a root task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: String,
    pub files: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    board: TaskBoard,
    context: ContextBus,
    subtasks: SubtaskMap,
    wakeup: WakeupBus,
    channel: ChannelBus,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(workdir: &WorkDir, cfg: OrchestratorConfig, channel: ChannelBus) -> Self {
        Self {
            board: TaskBoard::new(workdir),
            context: ContextBus::new(workdir),
            subtasks: SubtaskMap::new(workdir),
            wakeup: WakeupBus::new(workdir.signals_dir()),
            channel,
            cfg,
        }
    }

    pub fn channel(&self) -> &ChannelBus {
        &self.channel
    }

    /// Classify and enqueue a user request. Non-blocking; returns the root
    /// task id immediately.
    pub fn submit(&self, user_text: &str, source: TaskSource) -> Result<String> {
        let decision = classify(user_text);
        let complexity = match decision {
            RouteDecision::DirectAnswer => Complexity::Simple,
            RouteDecision::Pipeline => Complexity::Normal,
        };

        let task = self.board.create(
            NewTask::new(user_text)
                .with_role("planner")
                .with_complexity(complexity)
                .with_source(source),
        )?;

        // Intent anchor: reviewers and close-out read the original ask here.
        self.context.publish(
            "system",
            &format!("intent:{}", task.id),
            json!(user_text),
            ContextLayer::Task,
            None,
            Provenance::user(
                task.source
                    .as_ref()
                    .map(|s| s.channel.clone())
                    .unwrap_or_default(),
            ),
        )?;

        info!(task_id = %task.id, route = ?decision, "request submitted");
        self.channel
            .publish(ChannelEvent::status(&task.id, TaskPhase::Planning, None));
        self.wakeup.notify();
        Ok(task.id)
    }

    /// Poll until the root task terminates or the timeout elapses.
    ///
    /// Emits a progress `status` event on the configured cadence. On
    /// timeout the root fails with reason `timeout` and every non-terminal
    /// descendant is cancelled.
    pub async fn wait(&self, task_id: &str, timeout: Option<Duration>) -> Result<TaskOutcome> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.cfg.task_timeout));
        let poll = Duration::from_secs(self.cfg.poll_interval.max(1));
        let progress_every = Duration::from_secs(self.cfg.progress_interval.max(1));

        let started = std::time::Instant::now();
        let mut last_progress = std::time::Instant::now();

        loop {
            let task = self
                .board
                .get(task_id)?
                .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;

            if task.is_terminal() {
                return Ok(self.deliver(task)?);
            }

            if started.elapsed() >= timeout {
                warn!(task_id = %task_id, "task deadline exceeded");
                self.board.fail(task_id, "timeout")?;
                self.cancel_descendants(task_id)?;
                let failed = self
                    .board
                    .get(task_id)?
                    .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
                let _ = self.deliver(failed);
                return Err(OrchestratorError::Timeout {
                    task_id: task_id.to_string(),
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }

            if last_progress.elapsed() >= progress_every {
                last_progress = std::time::Instant::now();
                let phase = self.phase_of_tree(&task)?;
                self.channel.publish(ChannelEvent::status(
                    task_id,
                    phase,
                    task.agent_id.clone(),
                ));
            }

            tokio::time::sleep(poll).await;
        }
    }

    /// Cooperatively cancel a task and its whole subtree.
    pub fn cancel(&self, task_id: &str) -> Result<TaskOutcome> {
        self.board.cancel(task_id)?;
        self.cancel_descendants(task_id)?;
        self.wakeup.notify();

        let task = self
            .board
            .get(task_id)?
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        self.deliver(task)
    }

    fn cancel_descendants(&self, root_id: &str) -> Result<()> {
        for descendant in self.subtasks.descendants_of(root_id)? {
            match self.board.cancel(&descendant) {
                Ok(true) => info!(task_id = %descendant, "descendant cancelled"),
                Ok(false) => {}
                Err(e) => warn!(task_id = %descendant, error = %e, "cancel failed"),
            }
        }
        // Direct children may exist before the map entry does.
        for child in self.board.children_of(root_id)? {
            if !child.is_terminal() {
                let _ = self.board.cancel(&child.id);
            }
        }
        Ok(())
    }

    /// Emit the terminal `complete` event and clean up task-layer context.
    fn deliver(&self, task: Task) -> Result<TaskOutcome> {
        let raw = task.result.clone().unwrap_or_else(|| match task.status {
            TaskStatus::Cancelled => "Task was cancelled.".to_string(),
            TaskStatus::Failed => {
                let reason = task
                    .evolution_flags
                    .iter()
                    .rev()
                    .find(|f| f.starts_with("failed:"))
                    .map(|f| f.trim_start_matches("failed:").to_string())
                    .unwrap_or_else(|| "unknown error".into());
                format!("Task failed ({reason}). Task id: {}", task.id)
            }
            _ => String::new(),
        });
        let (result, file_names) = extract_file_markers(&raw);
        let files: Vec<PathBuf> = file_names.into_iter().map(PathBuf::from).collect();

        let _ = self.context.clear_task_layer();
        let _ = self.context.cleanup_expired();

        let outcome = TaskOutcome {
            task_id: task.id.clone(),
            status: task.status,
            result: result.clone(),
            files: files.clone(),
        };
        self.channel.publish(ChannelEvent::complete(
            &task.id,
            task.status.to_string(),
            result,
            files,
        ));
        Ok(outcome)
    }

    /// Derive the coarse progress phase from the state of the task tree.
    fn phase_of_tree(&self, root: &Task) -> Result<TaskPhase> {
        if root.status == TaskStatus::Synthesizing {
            return Ok(TaskPhase::Synthesizing);
        }
        let children = self.board.children_of(&root.id)?;
        if children.is_empty() {
            return Ok(TaskPhase::Planning);
        }
        if children
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Review | TaskStatus::Critique))
        {
            return Ok(TaskPhase::Critiquing);
        }
        Ok(TaskPhase::Executing)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::board::Claimant;

    fn orchestrator_in(dir: &std::path::Path) -> Orchestrator {
        let wd = WorkDir::new(dir);
        wd.ensure_layout().unwrap();
        Orchestrator::new(
            &wd,
            OrchestratorConfig {
                task_timeout: 600,
                poll_interval: 1,
                progress_interval: 30,
            },
            ChannelBus::new(),
        )
    }

    #[test]
    fn submit_creates_planner_task_with_intent_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());

        let task_id = orch
            .submit("What is TCP?", TaskSource::new("cli", "What is TCP?"))
            .unwrap();

        let task = orch.board.get(&task_id).unwrap().unwrap();
        assert_eq!(task.required_role.as_deref(), Some("planner"));
        // Direct-answer route maps to a simple planner task.
        assert_eq!(task.complexity, Complexity::Simple);

        let anchor = orch
            .context
            .get("system", &format!("intent:{task_id}"))
            .unwrap()
            .unwrap();
        assert_eq!(anchor.value, json!("What is TCP?"));
        assert_eq!(anchor.layer, ContextLayer::Task);
    }

    #[test]
    fn pipeline_requests_are_normal_complexity() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());
        let task_id = orch
            .submit(
                "Write a Python script that prints 1..10 and run it.",
                TaskSource::new("cli", ""),
            )
            .unwrap();
        let task = orch.board.get(&task_id).unwrap().unwrap();
        assert_eq!(task.complexity, Complexity::Normal);
    }

    #[tokio::test]
    async fn wait_returns_once_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());
        let rx = orch.channel().subscribe();

        let task_id = orch.submit("hi", TaskSource::new("cli", "hi")).unwrap();

        // Simulate the planner worker completing the direct answer.
        orch.board.claim_next(&Claimant::new("planner")).unwrap();
        orch.board.complete(&task_id, Some("Hello!")).unwrap();

        let outcome = orch.wait(&task_id, None).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.result, "Hello!");

        // One status at submit, one complete at delivery.
        let events: Vec<ChannelEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(ChannelEvent::Status { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Complete { status, .. } if status == "completed")));
    }

    #[tokio::test]
    async fn wait_timeout_fails_root_and_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());

        let root = orch
            .submit("build the whole system please", TaskSource::new("cli", ""))
            .unwrap();
        let child = orch
            .board
            .create(NewTask::new("child work").with_parent(root.clone()))
            .unwrap();
        orch.subtasks.register(&root, vec![child.id.clone()]).unwrap();

        let err = orch
            .wait(&root, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));

        let root_task = orch.board.get(&root).unwrap().unwrap();
        assert_eq!(root_task.status, TaskStatus::Failed);
        assert!(root_task.evolution_flags.iter().any(|f| f == "failed:timeout"));

        let child_task = orch.board.get(&child.id).unwrap().unwrap();
        assert_eq!(child_task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_cascades_and_emits_single_complete() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());
        let rx = orch.channel().subscribe();

        let root = orch
            .submit("analyze everything in the repo", TaskSource::new("cli", ""))
            .unwrap();
        let child = orch
            .board
            .create(NewTask::new("sub").with_parent(root.clone()))
            .unwrap();
        orch.subtasks.register(&root, vec![child.id.clone()]).unwrap();

        let outcome = orch.cancel(&root).unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(
            orch.board.get(&child.id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );

        let completes = rx
            .try_iter()
            .filter(|e| matches!(e, ChannelEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn delivery_extracts_file_markers() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(dir.path());

        let task_id = orch.submit("hey", TaskSource::new("cli", "hey")).unwrap();
        orch.board.claim_next(&Claimant::new("planner")).unwrap();
        orch.board
            .complete(&task_id, Some("Report ready.\nFILE: /tmp/out.pdf"))
            .unwrap();

        let task = orch.board.get(&task_id).unwrap().unwrap();
        let outcome = orch.deliver(task).unwrap();
        assert_eq!(outcome.result, "Report ready.");
        assert_eq!(outcome.files, vec![PathBuf::from("/tmp/out.pdf")]);
    }
}
