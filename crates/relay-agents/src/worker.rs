//! Per-agent worker event loop.
//!
//! Each tick runs, in priority order: mailbox scan (shutdown wins), planner
//! close-out duties, critique revision of the agent's own sent-back work,
//! then a regular claim. Idle ticks back off progressively on the wakeup
//! bus; after enough consecutive idle cycles the worker exits cleanly and
//! the lazy runtime relaunches it on demand. A 30-second sweep inside the
//! loop feeds the board's stale-task recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use relay_bus::context::ContextBus;
use relay_bus::heartbeat::Heartbeat;
use relay_bus::mailbox::{
    CritiqueReply, CritiqueRequest, MailMessage, Mailbox, MailboxError, MessageKind,
};
use relay_bus::wakeup::WakeupBus;
use relay_core::board::{BoardError, Claimant, TaskBoard};
use relay_core::config::{AgentSpec, Config, WorkerConfig};
use relay_core::paths::WorkDir;
use relay_core::store::StoreError;
use relay_core::subtasks::SubtaskMap;
use relay_core::types::{Complexity, CritiqueSpec, NewTask, Task, TaskStatus};
use relay_llm::provider::{ChatConfig, ChatMessage, LlmError};
use relay_llm::router::ProviderRouter;
use relay_telemetry::audit::{AuditLog, ToolAuditRecord};

use crate::critique::{build_critique_prompt, build_revision_prompt, fallback_critique, parse_critique};
use crate::output::clean_result;
use crate::prompts::{build_system_prompt, PromptInputs};
use crate::spec::{
    cap_specs, extract_specs, infer_role, parse_route_override, strip_route_lines, RouteOverride,
    SubTaskSpec,
};
use crate::tools::{extract_tool_calls, ToolDispatcher};

/// Cadence of the in-worker stale-recovery sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Grace after finishing a task before the heartbeat reads "idle".
const WRAP_UP_GRACE: Duration = Duration::from_millis(1_500);
/// Tool rounds allowed during close-out synthesis.
const SYNTHESIS_TOOL_ROUNDS: u32 = 3;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unknown agent id: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The current task was cancelled; not an error, the loop moves on.
    #[error("task cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// Everything a worker needs, handed in by the supervisor.
pub struct WorkerContext {
    pub agent: AgentSpec,
    pub workdir: WorkDir,
    pub board: Arc<TaskBoard>,
    pub context: ContextBus,
    pub mailbox: Mailbox,
    pub wakeup: WakeupBus,
    pub heartbeat: Heartbeat,
    pub router: Arc<ProviderRouter>,
    pub tools: Arc<dyn ToolDispatcher>,
    pub subtasks: SubtaskMap,
    pub worker_cfg: WorkerConfig,
    pub prompt_budget: usize,
    pub audit: AuditLog,
}

impl WorkerContext {
    /// Assemble a context for `agent_id` from the application config.
    pub fn build(
        config: &Config,
        workdir: WorkDir,
        agent_id: &str,
        router: Arc<ProviderRouter>,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Result<Self> {
        let agent = config
            .agent(agent_id)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownAgent(agent_id.to_string()))?;

        let policy = relay_core::board::RolePolicy::from_agents(&config.agents);
        Ok(Self {
            board: Arc::new(TaskBoard::new(&workdir).with_policy(policy)),
            context: ContextBus::new(&workdir),
            mailbox: Mailbox::new(workdir.clone()),
            wakeup: WakeupBus::new(workdir.signals_dir()),
            heartbeat: Heartbeat::new(&workdir, agent_id),
            subtasks: SubtaskMap::new(&workdir),
            audit: AuditLog::new(workdir.tool_audit_file()),
            workdir,
            agent,
            router,
            tools,
            worker_cfg: config.worker.clone(),
            prompt_budget: config.compaction.prompt_budget_chars,
        })
    }
}

// ---------------------------------------------------------------------------
// AgentWorker
// ---------------------------------------------------------------------------

pub struct AgentWorker {
    ctx: WorkerContext,
    idle_count: u32,
    last_sweep: Instant,
    last_work: Option<Instant>,
}

impl AgentWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            idle_count: 0,
            last_sweep: Instant::now(),
            last_work: None,
        }
    }

    fn agent_id(&self) -> &str {
        &self.ctx.agent.id
    }

    fn is_planner(&self) -> bool {
        let id = self.ctx.agent.id.to_lowercase();
        let role = self.ctx.agent.role.to_lowercase();
        id.contains("planner") || role.contains("plan")
    }

    fn claimant(&self) -> Claimant {
        Claimant::new(self.agent_id())
            .with_reputation(self.ctx.agent.reputation)
            .with_role(self.ctx.agent.role.clone())
    }

    /// Run until a shutdown message arrives or the idle limit is reached.
    /// Both are clean exits.
    pub async fn run(&mut self) -> Result<()> {
        info!(agent_id = %self.agent_id(), "worker loop starting");

        loop {
            self.beat();

            if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.last_sweep = Instant::now();
                match self.ctx.board.recover_stale_tasks() {
                    Ok(0) => {}
                    Ok(n) => info!(agent_id = %self.agent_id(), recovered = n, "stale tasks recovered"),
                    Err(e) => warn!(agent_id = %self.agent_id(), error = %e, "stale sweep failed"),
                }
            }

            // 1. Mailbox scan - shutdown beats everything else in the batch.
            let messages = self.ctx.mailbox.drain(self.agent_id())?;
            if messages.iter().any(|m| m.kind == MessageKind::Shutdown) {
                info!(agent_id = %self.agent_id(), "shutdown message received, exiting");
                self.ctx.heartbeat.stop();
                return Ok(());
            }
            for message in messages {
                self.handle_message(message).await;
            }

            // Planner close-out duties.
            if self.is_planner() {
                if let Err(e) = self.check_closeouts().await {
                    warn!(agent_id = %self.agent_id(), error = %e, "close-out pass failed");
                }
            }

            // 2. Revision of our own sent-back task.
            if let Some(task) = self.own_critique_task()? {
                self.mark_worked();
                if let Err(e) = self.run_revision(task).await {
                    warn!(agent_id = %self.agent_id(), error = %e, "revision failed");
                }
                continue;
            }

            // 3. Regular claim.
            match self.ctx.board.claim_next(&self.claimant())? {
                Some(task) => {
                    self.mark_worked();
                    let task_id = task.id.clone();
                    if let Err(e) = self.run_task(task).await {
                        match e {
                            WorkerError::Cancelled => {
                                debug!(task_id = %task_id, "task cancelled mid-run")
                            }
                            e => {
                                error!(task_id = %task_id, error = %e, "task run failed");
                                let _ = self.ctx.board.fail(&task_id, &e.to_string());
                            }
                        }
                    }
                    continue;
                }
                None => {}
            }

            // 4. Idle.
            if self.idle_tick().await? {
                self.ctx.heartbeat.stop();
                return Ok(());
            }
        }
    }

    /// One idle cycle; returns `true` when the worker should exit.
    async fn idle_tick(&mut self) -> Result<bool> {
        let active = self.ctx.board.has_active_tasks()?;
        let closeouts_pending = self.is_planner() && !self.ctx.subtasks.is_empty()?;
        let max_idle = self.ctx.worker_cfg.max_idle_cycles;

        if active || closeouts_pending {
            // Half rate while teammates are still working, so an executor
            // outlives a slow sibling sub-task.
            self.idle_count = (self.idle_count + 1).min(max_idle / 2);
        } else {
            self.idle_count += 1;
        }

        if self.idle_count >= max_idle && !active && !closeouts_pending {
            info!(agent_id = %self.agent_id(), "idle limit reached, exiting");
            return Ok(true);
        }

        // Progressive backoff 1s -> 5s; the wakeup bus shortcuts the wait.
        let backoff = (1.0 + f64::from(self.idle_count) * 0.5).min(5.0);
        self.ctx
            .wakeup
            .wait(Duration::from_secs_f64(backoff))
            .await;
        Ok(false)
    }

    fn beat(&self) {
        let wrapping_up = self
            .last_work
            .map(|at| at.elapsed() < WRAP_UP_GRACE)
            .unwrap_or(false);
        if wrapping_up {
            self.ctx.heartbeat.beat("working", Some("wrapping up..."));
        } else {
            self.ctx.heartbeat.beat("idle", None);
        }
    }

    fn mark_worked(&mut self) {
        self.idle_count = 0;
        self.last_work = Some(Instant::now());
    }

    // -----------------------------------------------------------------------
    // Mailbox handling
    // -----------------------------------------------------------------------

    async fn handle_message(&self, message: MailMessage) {
        match message.kind {
            MessageKind::Shutdown => unreachable!("handled by the batch scan"),
            MessageKind::CritiqueRequest => {
                if let Err(e) = self.handle_critique_request(&message).await {
                    warn!(
                        agent_id = %self.agent_id(),
                        from = %message.from,
                        error = %e,
                        "critique request failed"
                    );
                }
            }
            MessageKind::CritiqueReply => {
                debug!(agent_id = %self.agent_id(), from = %message.from, "critique reply received");
            }
            MessageKind::Message => {
                debug!(agent_id = %self.agent_id(), from = %message.from, "peer message received");
            }
        }
    }

    /// Score a teammate's output and apply the verdict to the board.
    async fn handle_critique_request(&self, message: &MailMessage) -> Result<()> {
        let request = CritiqueRequest::from_content(&message.content)?;

        // Intent anchor: the original user ask for this task tree.
        let intent = match self.ctx.board.get(&request.task_id)? {
            Some(task) => match task.parent_id {
                Some(parent) => self
                    .ctx
                    .context
                    .get("system", &format!("intent:{parent}"))?
                    .and_then(|e| e.value.as_str().map(str::to_string)),
                None => None,
            },
            None => None,
        };

        let prompt = build_critique_prompt(intent.as_deref(), &request.description, &request.result);
        let messages = [ChatMessage::user(prompt)];
        let chat_cfg = self.chat_config();

        let mut critique = match self
            .ctx
            .router
            .chat(&messages, &chat_cfg, None, &self.ctx.agent.fallback_models)
            .await
        {
            Ok((response, _)) => parse_critique(response.text()).unwrap_or_else(|e| {
                warn!(task_id = %request.task_id, error = %e, "unparseable critique, using fallback");
                fallback_critique()
            }),
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "critique model call failed");
                fallback_critique()
            }
        };
        critique.task_id = request.task_id.clone();
        critique.reviewer_id = self.agent_id().to_string();
        critique.timestamp = Some(Utc::now());

        info!(
            task_id = %request.task_id,
            verdict = ?critique.verdict,
            score = critique.composite_score(),
            "critique applied"
        );
        self.ctx.board.add_critique(&request.task_id, critique.clone())?;

        // Tell the executor its verdict landed; it revises via the board.
        let reply = CritiqueReply {
            task_id: request.task_id.clone(),
            critique,
        };
        let _ = self.ctx.mailbox.send(
            &message.from,
            MailMessage::new(self.agent_id(), MessageKind::CritiqueReply, reply.into_content()),
        );
        self.ctx.wakeup.notify();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Revision
    // -----------------------------------------------------------------------

    fn own_critique_task(&self) -> Result<Option<Task>> {
        Ok(self
            .ctx
            .board
            .list()?
            .into_iter()
            .find(|t| {
                t.status == TaskStatus::Critique && t.agent_id.as_deref() == Some(self.agent_id())
            }))
    }

    async fn run_revision(&self, task: Task) -> Result<()> {
        let task = self.ctx.board.claim_critique(&task.id, self.agent_id())?;
        let critique = task.critique.clone().unwrap_or_else(fallback_critique);
        let previous = task.result.clone().unwrap_or_default();

        let prompt = build_revision_prompt(&task_user_message(&task), &previous, &critique);
        let messages = [ChatMessage::user(prompt)];
        let chat_cfg = self.chat_config();

        let revised = match self
            .ctx
            .router
            .chat(&messages, &chat_cfg, None, &self.ctx.agent.fallback_models)
            .await
        {
            Ok((response, _)) => clean_result(response.text()),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "revision model call failed, keeping previous result");
                previous
            }
        };

        // The rework cap turns this submission into completion.
        let updated = self
            .ctx
            .board
            .submit_for_review(&task.id, self.agent_id(), &revised)?;
        info!(task_id = %task.id, status = %updated.status, "revision submitted");
        self.ctx.wakeup.notify();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task execution
    // -----------------------------------------------------------------------

    async fn run_task(&self, task: Task) -> Result<()> {
        info!(
            agent_id = %self.agent_id(),
            task_id = %task.id,
            complexity = %task.complexity,
            "running task"
        );
        let excerpt: String = task.description.chars().take(80).collect();
        self.ctx.heartbeat.beat("working", Some(&excerpt));

        let output = self.run_tool_loop(&task).await?;
        let cleaned = clean_result(&output);

        let planner_route = self.is_planner()
            && task
                .required_role
                .as_deref()
                .map(|r| matches!(r.to_lowercase().as_str(), "planner" | "plan"))
                .unwrap_or(false);

        if planner_route {
            self.finish_planner_task(&task, &cleaned).await
        } else {
            self.finish_executor_task(&task, &cleaned).await
        }
    }

    /// Planner path: direct answers complete immediately; otherwise extract
    /// sub-tasks and hold the parent open for close-out. An explicit
    /// `ROUTE: DIRECT_ANSWER` in the planner's output wins over extraction.
    async fn finish_planner_task(&self, task: &Task, output: &str) -> Result<()> {
        if task.complexity == Complexity::Simple {
            self.ctx.board.complete(&task.id, Some(output))?;
            return Ok(());
        }

        if parse_route_override(output) == Some(RouteOverride::DirectAnswer) {
            let answer = strip_route_lines(output);
            self.ctx.board.begin_synthesis(&task.id, self.agent_id())?;
            self.ctx.board.complete(&task.id, Some(&answer))?;
            return Ok(());
        }

        let specs = cap_specs(extract_specs(output));
        if specs.is_empty() {
            // Fallback delegation: the planner's own text is the answer.
            self.ctx.board.begin_synthesis(&task.id, self.agent_id())?;
            self.ctx.board.complete(&task.id, Some(output))?;
            return Ok(());
        }

        let mut child_ids = Vec::with_capacity(specs.len());
        for mut spec in specs {
            if spec.parent_intent.is_empty() {
                spec.parent_intent = task
                    .source
                    .as_ref()
                    .map(|s| s.text.clone())
                    .unwrap_or_else(|| task.description.clone());
            }
            let role = infer_role(&spec.objective);
            let mut new_task = NewTask::new(spec.to_task_description())
                .with_role(role)
                .with_complexity(spec.complexity)
                .with_parent(task.id.clone());
            if let Some(source) = task.source.clone() {
                new_task = new_task.with_source(source);
            }
            let child = self.ctx.board.create(new_task)?;
            let objective: String = spec.objective.chars().take(60).collect();
            info!(
                parent = %task.id,
                child = %child.id,
                role,
                complexity = %spec.complexity,
                objective = %objective,
                "sub-task created"
            );
            child_ids.push(child.id);
        }

        self.ctx.subtasks.register(&task.id, child_ids)?;
        self.ctx.wakeup.notify();
        Ok(())
    }

    /// Executor path: simple tasks complete directly, everything else goes
    /// through review with a critique request to the reviewers. Review-role
    /// tasks are the quality gate itself and are never re-reviewed.
    async fn finish_executor_task(&self, task: &Task, output: &str) -> Result<()> {
        if task.complexity == Complexity::Simple {
            self.ctx.board.complete(&task.id, Some(output))?;
            return Ok(());
        }

        self.ctx
            .board
            .submit_for_review(&task.id, self.agent_id(), output)?;

        let is_review_task = task
            .required_role
            .as_deref()
            .map(|r| matches!(r.to_lowercase().as_str(), "review" | "critique"))
            .unwrap_or(false);
        if is_review_task {
            // The quality gate itself is never re-reviewed: seal it.
            let mut critique = CritiqueSpec::lgtm();
            critique.task_id = task.id.clone();
            critique.reviewer_id = self.agent_id().to_string();
            self.ctx.board.add_critique(&task.id, critique)?;
            self.ctx.wakeup.notify();
            return Ok(());
        }

        let request = CritiqueRequest {
            task_id: task.id.clone(),
            description: task_user_message(task),
            result: output.to_string(),
        };
        let mut sent = 0;
        for reviewer in &self.ctx.worker_cfg.reviewers {
            if reviewer == self.agent_id() {
                continue;
            }
            self.ctx.mailbox.send(
                reviewer,
                MailMessage::new(
                    self.agent_id(),
                    MessageKind::CritiqueRequest,
                    request.clone().into_content(),
                ),
            )?;
            sent += 1;
        }

        if sent == 0 {
            // Nobody to ask: the advisor never blocks, so self-approve with
            // low confidence instead of waiting out the review staleness.
            warn!(task_id = %task.id, "no reviewer reachable, auto-approving");
            let mut critique = fallback_critique();
            critique.task_id = task.id.clone();
            critique.reviewer_id = self.agent_id().to_string();
            self.ctx.board.add_critique(&task.id, critique)?;
        }
        self.ctx.wakeup.notify();
        Ok(())
    }

    /// Model conversation with tool dispatch, capped at the configured
    /// iteration count. Cancellation is polled before every model call.
    async fn run_tool_loop(&self, task: &Task) -> Result<String> {
        self.run_conversation(task, task_user_message(task), self.ctx.worker_cfg.max_tool_iterations)
            .await
    }

    async fn run_conversation(
        &self,
        task: &Task,
        user_message: String,
        max_iterations: u32,
    ) -> Result<String> {
        let catalog = self.ctx.tools.catalog();
        let snapshot = self.ctx.context.snapshot()?;
        let system_prompt = build_system_prompt(
            &PromptInputs {
                role_text: &self.ctx.agent.role,
                soul: self.ctx.agent.soul.as_deref(),
                skills: &self.ctx.agent.skills,
                tools: &catalog,
                context: &snapshot,
                memory: None,
                user_profile: None,
            },
            self.ctx.prompt_budget,
        );

        let mut chat_cfg = self.chat_config();
        chat_cfg.system_prompt = Some(system_prompt);

        let mut messages = vec![ChatMessage::user(user_message)];
        let mut last_text = String::new();

        for iteration in 0..max_iterations {
            if self.ctx.board.is_cancelled(&task.id) {
                return Err(WorkerError::Cancelled);
            }

            let tools = (!catalog.is_empty()).then_some(catalog.as_slice());
            let (response, provider) = self
                .ctx
                .router
                .chat(&messages, &chat_cfg, tools, &self.ctx.agent.fallback_models)
                .await?;
            debug!(
                task_id = %task.id,
                provider = %provider,
                iteration,
                tool_calls = response.tool_calls.len(),
                "model round complete"
            );

            let calls = extract_tool_calls(&response);
            last_text = response.text().to_string();
            if calls.is_empty() {
                return Ok(last_text);
            }

            messages.push(ChatMessage::assistant(if last_text.is_empty() {
                format!("[calling {} tool(s)]", calls.len())
            } else {
                last_text.clone()
            }));

            for call in calls {
                if self.ctx.board.is_cancelled(&task.id) {
                    return Err(WorkerError::Cancelled);
                }
                // One repair pass for malformed argument JSON before giving up.
                let params: serde_json::Value = serde_json::from_str(&call.arguments)
                    .or_else(|_| {
                        serde_json::from_str(&crate::spec::repair_json_quotes(&call.arguments))
                    })
                    .unwrap_or_else(|_| json!({}));
                let outcome = self.ctx.tools.invoke(&call.name, params.clone()).await;

                self.ctx.audit.append(&ToolAuditRecord {
                    agent_id: self.agent_id().to_string(),
                    task_id: task.id.clone(),
                    tool: call.name.clone(),
                    params,
                    ok: outcome.is_ok(),
                    detail: outcome.as_ref().err().map(|e| e.to_string()),
                    ts: Utc::now(),
                });

                let feed = match outcome {
                    Ok(value) => value.to_string(),
                    Err(e) => json!({ "error": { "kind": e.kind(), "message": e.to_string() } })
                        .to_string(),
                };
                messages.push(ChatMessage::tool(feed, call.id));
            }
        }

        warn!(task_id = %task.id, "tool loop iteration cap reached");
        Ok(last_text)
    }

    // -----------------------------------------------------------------------
    // Close-out synthesis
    // -----------------------------------------------------------------------

    /// For every registered parent: keep its claim fresh, and once all
    /// children are terminal, synthesize the close-out and complete it.
    async fn check_closeouts(&self) -> Result<()> {
        for parent_id in self.ctx.subtasks.pending_parents()? {
            let Some(parent) = self.ctx.board.get(&parent_id)? else {
                self.ctx.subtasks.remove(&parent_id)?;
                continue;
            };
            if parent.is_terminal() {
                self.ctx.subtasks.remove(&parent_id)?;
                continue;
            }
            if parent.agent_id.as_deref() != Some(self.agent_id()) {
                continue;
            }
            let _ = self.ctx.board.touch(&parent_id);

            let child_ids = self.ctx.subtasks.children_of(&parent_id)?;
            let mut children = Vec::with_capacity(child_ids.len());
            for id in &child_ids {
                if let Some(child) = self.ctx.board.get(id)? {
                    children.push(child);
                }
            }
            if children.is_empty() || !children.iter().all(Task::is_terminal) {
                continue;
            }

            info!(parent = %parent_id, children = children.len(), "all sub-tasks terminal, synthesizing");
            self.ctx.board.begin_synthesis(&parent_id, self.agent_id())?;

            let prompt = build_closeout_prompt(&parent, &children);
            let output = match self
                .run_conversation(&parent, prompt, SYNTHESIS_TOOL_ROUNDS)
                .await
            {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) | Err(_) => {
                    warn!(parent = %parent_id, "synthesis produced nothing, joining raw results");
                    self.ctx.board.collect_results(&parent_id)?
                }
            };

            self.ctx
                .board
                .complete(&parent_id, Some(&clean_result(&output)))?;
            self.ctx.subtasks.remove(&parent_id)?;
            self.ctx.wakeup.notify();
        }
        Ok(())
    }

    fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            model: self.ctx.agent.model.clone(),
            ..ChatConfig::default()
        }
    }
}

/// Convenience: construct and run a worker for one agent.
pub async fn run_worker(
    config: &Config,
    workdir: WorkDir,
    agent_id: &str,
    router: Arc<ProviderRouter>,
    tools: Arc<dyn ToolDispatcher>,
) -> Result<()> {
    let ctx = WorkerContext::build(config, workdir, agent_id, router, tools)?;
    AgentWorker::new(ctx).run().await
}

// ---------------------------------------------------------------------------
// Prompt shaping
// ---------------------------------------------------------------------------

/// Render a task's description for the model: structured tickets become a
/// readable brief, raw user text passes through.
fn task_user_message(task: &Task) -> String {
    match SubTaskSpec::from_task_description(&task.description) {
        Some(spec) => {
            let mut out = format!("## Objective\n{}\n", spec.objective);
            if !spec.constraints.is_empty() {
                out.push_str(&format!("Constraints: {}\n", spec.constraints.join("; ")));
            }
            out.push_str(&format!("Output format: {:?}\n", spec.output_format));
            if !spec.tool_hint.is_empty() {
                out.push_str(&format!("Preferred tools: {}\n", spec.tool_hint.join(", ")));
            }
            if !spec.parent_intent.is_empty() {
                out.push_str(&format!("\nOriginal user request: {}\n", spec.parent_intent));
            }
            out
        }
        None => task.description.clone(),
    }
}

/// The planner's close-out brief: original ask, ordered sub-task results
/// with attribution, outstanding critique items, and failure notes.
fn build_closeout_prompt(parent: &Task, children: &[Task]) -> String {
    let original = parent
        .source
        .as_ref()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or(&parent.description);

    let mut sections = format!(
        "All sub-tasks of this request are finished. Synthesize one final, \
         polished answer for the user.\n\n## Original request\n{original}\n\n## Sub-task results\n"
    );

    for (index, child) in children.iter().enumerate() {
        let role = child.required_role.as_deref().unwrap_or("worker");
        match child.status {
            TaskStatus::Completed => {
                sections.push_str(&format!(
                    "### {}. [{}] {}\n{}\n\n",
                    index + 1,
                    role,
                    summarize_objective(child),
                    child.result.as_deref().unwrap_or("(no output)"),
                ));
            }
            status => {
                let reason = child
                    .evolution_flags
                    .iter()
                    .rev()
                    .find(|f| f.starts_with("failed:"))
                    .cloned()
                    .unwrap_or_else(|| status.to_string());
                sections.push_str(&format!(
                    "### {}. [{}] {} - NOT COMPLETED ({})\n\n",
                    index + 1,
                    role,
                    summarize_objective(child),
                    reason,
                ));
            }
        }

        if let Some(critique) = &child.critique {
            for item in &critique.items {
                sections.push_str(&format!("> reviewer note: {}\n", item.issue));
            }
        }
    }

    sections.push_str(
        "\nNote failed sub-tasks briefly (category only, no internals). \
         To attach a produced file, add a line `FILE: <path>`.\n",
    );
    sections
}

fn summarize_objective(task: &Task) -> String {
    let text = SubTaskSpec::from_task_description(&task.description)
        .map(|s| s.objective)
        .unwrap_or_else(|| task.description.clone());
    text.chars().take(80).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::TaskSource;

    // Mint a task without going through the board.
    fn bare_task(description: &str) -> Task {
        serde_json::from_value(serde_json::json!({
            "id": "t-test",
            "description": description,
            "status": "pending",
            "created_at": 1_700_000_000.0,
        }))
        .unwrap()
    }

    fn task_with_description(description: &str) -> Task {
        let mut task = bare_task(description);
        task.required_role = Some("implement".into());
        task
    }

    #[test]
    fn plain_description_passes_through() {
        let task = task_with_description("just do it");
        assert_eq!(task_user_message(&task), "just do it");
    }

    #[test]
    fn spec_description_renders_brief() {
        let mut spec = SubTaskSpec::from_objective("Fetch the data", Complexity::Normal);
        spec.parent_intent = "get me a report".into();
        spec.tool_hint = vec!["web".into()];
        let task = task_with_description(&spec.to_task_description());

        let message = task_user_message(&task);
        assert!(message.contains("## Objective\nFetch the data"));
        assert!(message.contains("Preferred tools: web"));
        assert!(message.contains("get me a report"));
    }

    #[test]
    fn closeout_prompt_orders_and_attributes() {
        let mut parent = bare_task("root");
        parent.source = Some(TaskSource::new("cli", "write and run a script"));

        let mut first = task_with_description(
            &SubTaskSpec::from_objective("Write the script", Complexity::Normal)
                .to_task_description(),
        );
        first.status = TaskStatus::Completed;
        first.result = Some("print(42)".into());

        let mut second = task_with_description("Run the script");
        second.status = TaskStatus::Failed;
        second.evolution_flags.push("failed:timeout".into());

        let prompt = build_closeout_prompt(&parent, &[first, second]);
        assert!(prompt.contains("write and run a script"));
        assert!(prompt.contains("### 1. [implement] Write the script"));
        assert!(prompt.contains("print(42)"));
        assert!(prompt.contains("NOT COMPLETED (failed:timeout)"));
        let pos1 = prompt.find("### 1.").unwrap();
        let pos2 = prompt.find("### 2.").unwrap();
        assert!(pos1 < pos2);
    }
}
