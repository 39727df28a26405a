//! Durable, crash-safe task board.
//!
//! The board is a single JSON document (`task_board.json`) guarded by a
//! sibling lockfile. Every mutation takes the exclusive lock, re-reads the
//! whole document, validates its preconditions, writes the new state
//! atomically, and releases. Readers snapshot without the lock and tolerate
//! eventual consistency between snapshots.
//!
//! Agent processes self-claim work with [`TaskBoard::claim_next`]: the lock
//! makes claims atomic, so for any two concurrent claims of the same task
//! exactly one caller wins.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::paths::WorkDir;
use crate::store::{JsonStore, StoreError};
use crate::types::{CritiqueSpec, CritiqueVerdict, Complexity, NewTask, Task, TaskStatus};

/// Claimed tasks older than this are returned to `pending` by the sweep.
const STALE_CLAIM_SECS: i64 = 180;
/// Review tasks older than this are force-completed with the stored result.
const STALE_REVIEW_SECS: i64 = 300;
/// A task revised once completes regardless of further critique.
const MAX_CRITIQUE_ROUNDS: u32 = 1;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task references unknown blocker {0}")]
    UnknownBlocker(String),

    #[error("dependency cycle through task {0}")]
    DependencyCycle(String),

    #[error("task {id} is owned by {owner:?}, not {caller}")]
    NotOwner {
        id: String,
        owner: Option<String>,
        caller: String,
    },

    /// Simple tasks complete directly; review is for normal/complex work.
    #[error("task {0} is simple and completes without review")]
    SimpleTaskReview(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BoardError>;

// ---------------------------------------------------------------------------
// Role routing
// ---------------------------------------------------------------------------

/// Which agents may claim which `required_role`s.
///
/// Strict roles (planner/plan, review/critique) admit only the mapped agent
/// ids; loose roles (implement/execute/code) admit any non-restricted,
/// non-specialist agent - the planner never moonlights as an executor and
/// the reviewer identities may only claim review work. Matching the role
/// map by exact id avoids substring false positives ("Do not implement"
/// inside a planner role must not route implement work to it).
#[derive(Debug, Clone)]
pub struct RolePolicy {
    strict: HashMap<String, HashSet<String>>,
    restricted: HashSet<String>,
    /// Union of the strict sets: agents that stick to their specialty.
    specialists: HashSet<String>,
}

impl Default for RolePolicy {
    fn default() -> Self {
        let planners: HashSet<String> = ["planner".to_string()].into_iter().collect();
        let reviewers: HashSet<String> = ["reviewer".to_string(), "auditor".to_string()]
            .into_iter()
            .collect();

        let mut strict = HashMap::new();
        strict.insert("planner".to_string(), planners.clone());
        strict.insert("plan".to_string(), planners.clone());
        strict.insert("review".to_string(), reviewers.clone());
        strict.insert("critique".to_string(), reviewers.clone());

        let specialists = planners.union(&reviewers).cloned().collect();
        Self {
            strict,
            restricted: reviewers,
            specialists,
        }
    }
}

impl RolePolicy {
    pub fn new(strict: HashMap<String, HashSet<String>>, restricted: HashSet<String>) -> Self {
        let specialists = strict.values().flatten().cloned().collect();
        Self {
            strict,
            restricted,
            specialists,
        }
    }

    /// Derive the policy from the configured agents: ids whose role mentions
    /// planning serve the planner roles, review-flavoured (or explicitly
    /// restricted) ids serve the review roles and may claim nothing else.
    /// Falls back to the defaults when the config names no such agents.
    pub fn from_agents(agents: &[crate::config::AgentSpec]) -> Self {
        let defaults = Self::default();
        let mut planners = HashSet::new();
        let mut reviewers = HashSet::new();

        for agent in agents {
            let id = agent.id.to_lowercase();
            let role = agent.role.to_lowercase();
            if agent.restricted || role.contains("review") || role.contains("critique") {
                reviewers.insert(id);
            } else if role.contains("plan") || id.contains("planner") {
                planners.insert(id);
            }
        }

        if planners.is_empty() {
            planners = defaults.strict["planner"].clone();
        }
        if reviewers.is_empty() {
            reviewers = defaults.restricted.clone();
        }

        let mut strict = HashMap::new();
        strict.insert("planner".to_string(), planners.clone());
        strict.insert("plan".to_string(), planners);
        strict.insert("review".to_string(), reviewers.clone());
        strict.insert("critique".to_string(), reviewers.clone());
        Self::new(strict, reviewers)
    }

    /// Can `agent_id` (with optional declared role) claim a task requiring
    /// `required_role`?
    pub fn allows(
        &self,
        required_role: Option<&str>,
        agent_id: &str,
        agent_role: Option<&str>,
    ) -> bool {
        let aid = agent_id.to_lowercase();

        let Some(req) = required_role else {
            // Untyped tasks are open to any non-restricted agent.
            return !self.restricted.contains(&aid);
        };
        let req = req.to_lowercase();

        if let Some(allowed) = self.strict.get(&req) {
            if allowed.contains(&aid) || req == aid {
                return true;
            }
            return agent_role
                .map(|r| allowed.contains(&r.to_lowercase()))
                .unwrap_or(false);
        }

        // Loose role: generalists only.
        !self.restricted.contains(&aid) && !self.specialists.contains(&aid)
    }

    /// Agent ids that could serve `required_role` (for on-demand launch).
    pub fn candidates_for(&self, required_role: &str, registered: &[String]) -> Vec<String> {
        let req = required_role.to_lowercase();
        if let Some(allowed) = self.strict.get(&req) {
            return registered
                .iter()
                .filter(|id| allowed.contains(&id.to_lowercase()) || id.to_lowercase() == req)
                .cloned()
                .collect();
        }
        registered
            .iter()
            .filter(|id| {
                let id = id.to_lowercase();
                !self.restricted.contains(&id) && !self.specialists.contains(&id)
            })
            .cloned()
            .collect()
    }
}

/// A claiming agent's identity for [`TaskBoard::claim_next`].
#[derive(Debug, Clone)]
pub struct Claimant {
    pub agent_id: String,
    pub reputation: i32,
    pub role: Option<String>,
}

impl Claimant {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            reputation: 100,
            role: None,
        }
    }

    pub fn with_reputation(mut self, reputation: i32) -> Self {
        self.reputation = reputation;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Tasks in insertion order - claim selection is FIFO.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BoardDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl BoardDocument {
    fn find(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn completed_ids(&self) -> HashSet<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TaskBoard
// ---------------------------------------------------------------------------

pub struct TaskBoard {
    store: JsonStore<BoardDocument>,
    policy: RolePolicy,
    stale_claim: ChronoDuration,
    stale_review: ChronoDuration,
}

impl TaskBoard {
    pub fn new(workdir: &WorkDir) -> Self {
        Self {
            store: JsonStore::new(workdir.board_file(), workdir.board_lock()),
            policy: RolePolicy::default(),
            stale_claim: ChronoDuration::seconds(STALE_CLAIM_SECS),
            stale_review: ChronoDuration::seconds(STALE_REVIEW_SECS),
        }
    }

    pub fn with_policy(mut self, policy: RolePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the stale-recovery windows (tests use short ones).
    pub fn with_stale_windows(mut self, claim: ChronoDuration, review: ChronoDuration) -> Self {
        self.stale_claim = claim;
        self.stale_review = review;
        self
    }

    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Create a task in `pending`. Rejects unknown blockers and dependency
    /// cycles.
    pub fn create(&self, new: NewTask) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;

        for blocker in &new.blocked_by {
            if doc.find(blocker).is_none() {
                return Err(BoardError::UnknownBlocker(blocker.clone()));
            }
        }

        let task = Task::from_new(new);
        if would_cycle(&doc, &task.id, &task.blocked_by) {
            return Err(BoardError::DependencyCycle(task.id));
        }

        tracing::info!(
            task_id = %task.id,
            role = task.required_role.as_deref().unwrap_or("any"),
            complexity = %task.complexity,
            blockers = task.blocked_by.len(),
            "task created"
        );
        doc.tasks.push(task.clone());
        self.store.save(&doc)?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Atomically grab the next claimable task this agent qualifies for.
    ///
    /// Candidates are scanned in insertion order (FIFO tie-break); the first
    /// pending task with all blockers completed, a satisfied reputation gate,
    /// and a role match wins.
    pub fn claim_next(&self, claimant: &Claimant) -> Result<Option<Task>> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let completed: HashSet<String> = doc
            .completed_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        let candidate = doc.tasks.iter_mut().find(|t| {
            t.status == TaskStatus::Pending
                && t.min_reputation <= claimant.reputation
                && t.blocked_by.iter().all(|b| completed.contains(b))
                && self.policy.allows(
                    t.required_role.as_deref(),
                    &claimant.agent_id,
                    claimant.role.as_deref(),
                )
        });

        match candidate {
            Some(task) => {
                task.status = TaskStatus::Claimed;
                task.agent_id = Some(claimant.agent_id.clone());
                task.claimed_at = Some(Utc::now());
                let claimed = task.clone();
                tracing::info!(
                    task_id = %claimed.id,
                    agent_id = %claimant.agent_id,
                    "task claimed"
                );
                self.store.save(&doc)?;
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    /// Re-claim a task sent back for revision. Strict ownership: only the
    /// original executor may adopt its critique.
    pub fn claim_critique(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Critique {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Claimed,
            });
        }
        if task.agent_id.as_deref() != Some(agent_id) {
            return Err(BoardError::NotOwner {
                id: task_id.to_string(),
                owner: task.agent_id.clone(),
                caller: agent_id.to_string(),
            });
        }

        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(Utc::now());
        let claimed = task.clone();
        tracing::info!(task_id = %task_id, agent_id = %agent_id, "critique re-claimed");
        self.store.save(&doc)?;
        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Store the executor's result and move to `review` - or straight to
    /// `completed` once the single revision round is spent.
    pub fn submit_for_review(&self, task_id: &str, agent_id: &str, result: &str) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Claimed {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Review,
            });
        }
        if task.agent_id.as_deref() != Some(agent_id) {
            return Err(BoardError::NotOwner {
                id: task_id.to_string(),
                owner: task.agent_id.clone(),
                caller: agent_id.to_string(),
            });
        }
        if task.complexity == Complexity::Simple {
            return Err(BoardError::SimpleTaskReview(task_id.to_string()));
        }

        task.result = Some(result.to_string());
        if task.critique_round >= MAX_CRITIQUE_ROUNDS {
            // Rework cap: the revision completes regardless of further critique.
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.agent_id = None;
            tracing::info!(task_id = %task_id, "revision completed (rework cap)");
        } else {
            task.status = TaskStatus::Review;
            task.submitted_at = Some(Utc::now());
            tracing::info!(task_id = %task_id, "submitted for review");
        }

        let updated = task.clone();
        self.store.save(&doc)?;
        Ok(updated)
    }

    /// Apply a reviewer's critique. `LGTM` completes the task; `NEEDS_WORK`
    /// opens a revision round for the original executor.
    ///
    /// Re-applying `LGTM` to an already-completed task is a benign no-op.
    pub fn add_critique(&self, task_id: &str, critique: CritiqueSpec) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status == TaskStatus::Completed && critique.verdict == CritiqueVerdict::Lgtm {
            return Ok(task.clone());
        }
        if task.status != TaskStatus::Review {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Critique,
            });
        }

        match critique.verdict {
            CritiqueVerdict::Lgtm => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.agent_id = None;
                tracing::info!(
                    task_id = %task_id,
                    score = critique.composite_score(),
                    "critique LGTM - task completed"
                );
            }
            CritiqueVerdict::NeedsWork => {
                task.status = TaskStatus::Critique;
                task.critique_round += 1;
                tracing::info!(
                    task_id = %task_id,
                    round = task.critique_round,
                    items = critique.items.len(),
                    "critique NEEDS_WORK - revision round opened"
                );
            }
        }
        task.critique = Some(critique);

        let updated = task.clone();
        self.store.save(&doc)?;
        Ok(updated)
    }

    /// Complete a task directly. Permitted from `claimed` only for simple
    /// tasks, and from `synthesizing` (planner close-out).
    pub fn complete(&self, task_id: &str, result: Option<&str>) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        let allowed = match task.status {
            TaskStatus::Claimed => task.complexity == Complexity::Simple,
            TaskStatus::Synthesizing => true,
            _ => false,
        };
        if !allowed {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Completed,
            });
        }

        if let Some(result) = result {
            task.result = Some(result.to_string());
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.agent_id = None;
        let updated = task.clone();
        tracing::info!(task_id = %task_id, "task completed");
        self.store.save(&doc)?;
        Ok(updated)
    }

    /// Mark a parent task as synthesizing its close-out. The synthesizing
    /// agent re-asserts ownership.
    pub fn begin_synthesis(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Claimed {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Synthesizing,
            });
        }
        if task.agent_id.as_deref() != Some(agent_id) {
            return Err(BoardError::NotOwner {
                id: task_id.to_string(),
                owner: task.agent_id.clone(),
                caller: agent_id.to_string(),
            });
        }

        task.status = TaskStatus::Synthesizing;
        let updated = task.clone();
        tracing::info!(task_id = %task_id, agent_id = %agent_id, "close-out synthesis started");
        self.store.save(&doc)?;
        Ok(updated)
    }

    /// Fail a non-terminal task, recording the reason in its flags.
    pub fn fail(&self, task_id: &str, reason: &str) -> Result<()> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }

        task.status = TaskStatus::Failed;
        task.agent_id = None;
        task.evolution_flags.push(format!("failed:{reason}"));
        tracing::warn!(task_id = %task_id, reason = %reason, "task failed");
        self.store.save(&doc)?;
        Ok(())
    }

    /// Cancel a task. Returns `true` if the task changed state; cancelling
    /// an already-terminal task is a benign no-op (`false`).
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.agent_id = None;
        tracing::info!(task_id = %task_id, "task cancelled");
        self.store.save(&doc)?;
        Ok(true)
    }

    pub fn pause(&self, task_id: &str) -> Result<()> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Claimed) {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Paused,
            });
        }
        task.status = TaskStatus::Paused;
        task.agent_id = None;
        task.claimed_at = None;
        self.store.save(&doc)?;
        Ok(())
    }

    pub fn resume(&self, task_id: &str) -> Result<()> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Paused {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        task.status = TaskStatus::Pending;
        self.store.save(&doc)?;
        Ok(())
    }

    /// Return a failed or cancelled task to the claimable pool.
    pub fn retry(&self, task_id: &str) -> Result<Task> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(BoardError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        task.status = TaskStatus::Pending;
        task.agent_id = None;
        task.claimed_at = None;
        task.submitted_at = None;
        task.completed_at = None;
        task.result = None;
        let updated = task.clone();
        tracing::info!(task_id = %task_id, "task retried");
        self.store.save(&doc)?;
        Ok(updated)
    }

    /// Refresh a claimed task's claim timestamp so the stale sweep leaves it
    /// alone (used by planners holding a parent open across close-out).
    pub fn touch(&self, task_id: &str) -> Result<()> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let task = doc
            .find_mut(task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_string()))?;
        if matches!(task.status, TaskStatus::Claimed | TaskStatus::Synthesizing) {
            task.claimed_at = Some(Utc::now());
            self.store.save(&doc)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stale recovery
    // -----------------------------------------------------------------------

    /// Recover tasks abandoned by crashed or wedged workers. Idempotent:
    /// running it twice produces the same board as running it once.
    ///
    /// - `claimed` older than the claim window → back to `pending`
    ///   (`timeout_recovered:claimed` flag, owner cleared);
    /// - `review` older than the review window → force-completed with the
    ///   stored result (the reviewer never blocks completion).
    pub fn recover_stale_tasks(&self) -> Result<usize> {
        let _guard = self.store.lock()?;
        let mut doc = self.store.load()?;
        let now = Utc::now();
        let mut recovered = 0;

        for task in doc.tasks.iter_mut() {
            match task.status {
                TaskStatus::Claimed => {
                    let stale = task
                        .claimed_at
                        .map(|at| now - at > self.stale_claim)
                        .unwrap_or(false);
                    if stale {
                        tracing::warn!(
                            task_id = %task.id,
                            agent_id = task.agent_id.as_deref().unwrap_or("?"),
                            "stale claim recovered to pending"
                        );
                        task.status = TaskStatus::Pending;
                        task.agent_id = None;
                        task.claimed_at = None;
                        task.evolution_flags
                            .push("timeout_recovered:claimed".to_string());
                        recovered += 1;
                    }
                }
                TaskStatus::Review => {
                    let stale = task
                        .submitted_at
                        .map(|at| now - at > self.stale_review)
                        .unwrap_or(false);
                    if stale {
                        tracing::warn!(task_id = %task.id, "stale review force-completed");
                        task.status = TaskStatus::Completed;
                        task.completed_at = Some(now);
                        task.agent_id = None;
                        task.evolution_flags
                            .push("timeout_recovered:review".to_string());
                        recovered += 1;
                    }
                }
                _ => {}
            }
        }

        if recovered > 0 {
            self.store.save(&doc)?;
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.store.load()?.find(task_id).cloned())
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.get(task_id)
            .ok()
            .flatten()
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        Ok(self.store.load()?.tasks)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .store
            .load()?
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count())
    }

    /// `required_role`s of currently-pending tasks (for on-demand launch).
    pub fn pending_roles(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .load()?
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.required_role.clone())
            .collect())
    }

    /// Any task still pending, claimed, under review/critique, or paused?
    pub fn has_active_tasks(&self) -> Result<bool> {
        Ok(self.store.load()?.tasks.iter().any(|t| {
            matches!(
                t.status,
                TaskStatus::Pending
                    | TaskStatus::Claimed
                    | TaskStatus::Review
                    | TaskStatus::Critique
                    | TaskStatus::Synthesizing
                    | TaskStatus::Paused
            )
        }))
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .store
            .load()?
            .tasks
            .into_iter()
            .filter(|t| t.agent_id.as_deref() == Some(agent_id))
            .collect())
    }

    /// Most recent tasks an agent has touched, newest first.
    pub fn history(&self, agent_id: &str, last: usize) -> Result<Vec<Task>> {
        let mut tasks = self.list_by_agent(agent_id)?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(last);
        Ok(tasks)
    }

    /// Completed children of a root task, in insertion order.
    pub fn children_of(&self, root_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .store
            .load()?
            .tasks
            .into_iter()
            .filter(|t| t.parent_id.as_deref() == Some(root_id))
            .collect())
    }

    /// Collect results for a task tree: child results joined with separators,
    /// falling back to the root's own result.
    pub fn collect_results(&self, root_id: &str) -> Result<String> {
        let doc = self.store.load()?;
        let child_results: Vec<&str> = doc
            .tasks
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(root_id))
            .filter_map(|t| t.result.as_deref())
            .collect();
        if !child_results.is_empty() {
            return Ok(child_results.join("\n\n---\n\n"));
        }
        Ok(doc
            .find(root_id)
            .and_then(|t| t.result.clone())
            .unwrap_or_default())
    }

    /// Remove all tasks. Used between chat turns and in tests.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.store.lock()?;
        self.store.save(&BoardDocument::default())?;
        Ok(())
    }
}

/// Would adding `new_id` with the given blockers close a dependency cycle?
///
/// Walks the transitive `blocked_by` edges from each blocker looking for the
/// new id. Edges only ever point at pre-existing tasks, so this holds the
/// DAG invariant for any future edge source as well.
fn would_cycle(doc: &BoardDocument, new_id: &str, blockers: &[String]) -> bool {
    let mut stack: Vec<&str> = blockers.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(id) = stack.pop() {
        if id == new_id {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(task) = doc.find(id) {
            stack.extend(task.blocked_by.iter().map(String::as_str));
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn board_in(dir: &std::path::Path) -> TaskBoard {
        TaskBoard::new(&WorkDir::new(dir))
    }

    #[test]
    fn unknown_blocker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let err = board
            .create(NewTask::new("x").with_blockers(vec!["nope".into()]))
            .unwrap_err();
        assert!(matches!(err, BoardError::UnknownBlocker(_)));
    }

    #[test]
    fn blocked_task_not_claimable_until_blocker_completes() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());

        let first = board
            .create(NewTask::new("first").with_complexity(Complexity::Simple))
            .unwrap();
        let second = board
            .create(NewTask::new("second").with_blockers(vec![first.id.clone()]))
            .unwrap();

        let claimant = Claimant::new("executor");
        let claimed = board.claim_next(&claimant).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);

        // Nothing else claimable while the blocker is open.
        assert!(board.claim_next(&claimant).unwrap().is_none());

        board.complete(&first.id, Some("done")).unwrap();
        let claimed = board.claim_next(&claimant).unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[test]
    fn claim_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let a = board.create(NewTask::new("a")).unwrap();
        let _b = board.create(NewTask::new("b")).unwrap();

        let claimed = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
    }

    #[test]
    fn reputation_gate_respected() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board
            .create(NewTask::new("hard").with_min_reputation(80))
            .unwrap();

        let weak = Claimant::new("executor").with_reputation(50);
        assert!(board.claim_next(&weak).unwrap().is_none());

        let strong = Claimant::new("executor").with_reputation(90);
        assert!(board.claim_next(&strong).unwrap().is_some());
    }

    #[test]
    fn strict_roles_only_for_mapped_agents() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board
            .create(NewTask::new("plan it").with_role("planner"))
            .unwrap();

        assert!(board
            .claim_next(&Claimant::new("executor"))
            .unwrap()
            .is_none());
        assert!(board.claim_next(&Claimant::new("planner")).unwrap().is_some());
    }

    #[test]
    fn restricted_agent_only_claims_review_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board
            .create(NewTask::new("build it").with_role("implement"))
            .unwrap();
        board
            .create(NewTask::new("check it").with_role("review"))
            .unwrap();

        let reviewer = Claimant::new("reviewer");
        let claimed = board.claim_next(&reviewer).unwrap().unwrap();
        assert_eq!(claimed.description, "check it");
        assert!(board.claim_next(&reviewer).unwrap().is_none());
    }

    #[test]
    fn claim_exclusivity_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let board = std::sync::Arc::new(board_in(dir.path()));
        board.create(NewTask::new("only one")).unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let board = board.clone();
            handles.push(std::thread::spawn(move || {
                board
                    .claim_next(&Claimant::new(format!("agent-{i}")))
                    .unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap().is_some() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn review_flow_lgtm_completes() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board.create(NewTask::new("work")).unwrap();

        let task = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();
        board
            .submit_for_review(&task.id, "executor", "result v1")
            .unwrap();

        let done = board.add_critique(&task.id, CritiqueSpec::lgtm()).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.agent_id.is_none());
        assert!(done.completed_at.is_some());

        // Idempotence: a second LGTM is a benign no-op.
        let again = board.add_critique(&task.id, CritiqueSpec::lgtm()).unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
    }

    #[test]
    fn needs_work_drives_exactly_one_revision() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board.create(NewTask::new("work")).unwrap();
        let task = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();
        board
            .submit_for_review(&task.id, "executor", "stub")
            .unwrap();

        let mut needs_work = CritiqueSpec::lgtm();
        needs_work.verdict = CritiqueVerdict::NeedsWork;
        needs_work.dimensions.accuracy = 4;

        let after = board.add_critique(&task.id, needs_work).unwrap();
        assert_eq!(after.status, TaskStatus::Critique);
        assert_eq!(after.critique_round, 1);
        // Ownership survives into the revision round.
        assert_eq!(after.agent_id.as_deref(), Some("executor"));

        // Only the original executor may re-claim.
        let err = board.claim_critique(&task.id, "other").unwrap_err();
        assert!(matches!(err, BoardError::NotOwner { .. }));

        board.claim_critique(&task.id, "executor").unwrap();
        let done = board
            .submit_for_review(&task.id, "executor", "revised")
            .unwrap();
        // Rework cap: the second submission auto-completes.
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("revised"));
    }

    #[test]
    fn simple_task_rejects_review() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        board
            .create(NewTask::new("trivial").with_complexity(Complexity::Simple))
            .unwrap();
        let task = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();

        let err = board
            .submit_for_review(&task.id, "executor", "out")
            .unwrap_err();
        assert!(matches!(err, BoardError::SimpleTaskReview(_)));

        let done = board.complete(&task.id, Some("out")).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[test]
    fn terminal_tasks_reject_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let task = board
            .create(NewTask::new("t").with_complexity(Complexity::Simple))
            .unwrap();
        board.claim_next(&Claimant::new("executor")).unwrap();
        board.complete(&task.id, None).unwrap();

        assert!(board.fail(&task.id, "late").is_err());
        assert!(!board.cancel(&task.id).unwrap());
        assert!(board.pause(&task.id).is_err());
    }

    #[test]
    fn retry_returns_failed_task_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let task = board.create(NewTask::new("t")).unwrap();
        board.claim_next(&Claimant::new("executor")).unwrap();
        board.fail(&task.id, "boom").unwrap();

        let retried = board.retry(&task.id).unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.agent_id.is_none());
        assert!(retried
            .evolution_flags
            .iter()
            .any(|f| f == "failed:boom"));
    }

    #[test]
    fn pause_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let task = board.create(NewTask::new("t")).unwrap();
        board.pause(&task.id).unwrap();
        assert_eq!(board.get(&task.id).unwrap().unwrap().status, TaskStatus::Paused);
        board.resume(&task.id).unwrap();
        assert_eq!(
            board.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn stale_claim_recovers_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path())
            .with_stale_windows(ChronoDuration::zero(), ChronoDuration::seconds(300));
        board.create(NewTask::new("t")).unwrap();
        let task = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let recovered = board.recover_stale_tasks().unwrap();
        assert_eq!(recovered, 1);

        let task = board.get(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.agent_id.is_none());
        assert!(task
            .evolution_flags
            .iter()
            .any(|f| f == "timeout_recovered:claimed"));

        // Idempotent: a second sweep changes nothing.
        assert_eq!(board.recover_stale_tasks().unwrap(), 0);
    }

    #[test]
    fn stale_review_force_completes() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path())
            .with_stale_windows(ChronoDuration::seconds(300), ChronoDuration::zero());
        board.create(NewTask::new("t")).unwrap();
        let task = board.claim_next(&Claimant::new("executor")).unwrap().unwrap();
        board
            .submit_for_review(&task.id, "executor", "the result")
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(board.recover_stale_tasks().unwrap(), 1);

        let task = board.get(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("the result"));
    }

    #[test]
    fn touch_refreshes_claim() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path())
            .with_stale_windows(ChronoDuration::milliseconds(50), ChronoDuration::seconds(300));
        board.create(NewTask::new("t")).unwrap();
        let task = board.claim_next(&Claimant::new("planner")).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(60));
        board.touch(&task.id).unwrap();
        assert_eq!(board.recover_stale_tasks().unwrap(), 0);
    }

    #[test]
    fn history_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        for i in 0..3 {
            board
                .create(NewTask::new(format!("t{i}")).with_complexity(Complexity::Simple))
                .unwrap();
        }
        assert_eq!(board.pending_count().unwrap(), 3);

        let claimant = Claimant::new("executor");
        let first = board.claim_next(&claimant).unwrap().unwrap();
        board.complete(&first.id, Some("done")).unwrap();
        let second = board.claim_next(&claimant).unwrap().unwrap();

        assert_eq!(board.pending_count().unwrap(), 1);
        // History only covers tasks this agent still owns or finished
        // holding a result; the completed one released its owner.
        let history = board.history("executor", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, second.id);

        board.clear().unwrap();
        assert!(board.list().unwrap().is_empty());
    }

    #[test]
    fn collect_results_prefers_children() {
        let dir = tempfile::tempdir().unwrap();
        let board = board_in(dir.path());
        let root = board.create(NewTask::new("root").with_role("planner")).unwrap();
        for label in ["one", "two"] {
            let child = board
                .create(
                    NewTask::new(label)
                        .with_parent(root.id.clone())
                        .with_complexity(Complexity::Simple),
                )
                .unwrap();
            board.claim_next(&Claimant::new("executor")).unwrap();
            board.complete(&child.id, Some(label)).unwrap();
        }

        let joined = board.collect_results(&root.id).unwrap();
        assert_eq!(joined, "one\n\n---\n\ntwo");
    }
}
