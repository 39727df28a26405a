use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Timestamp serde - documents carry Unix seconds (f64)
// ---------------------------------------------------------------------------

/// Serialize a `DateTime<Utc>` as fractional Unix seconds.
pub mod unix_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        let secs = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0;
        secs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(d)?;
        from_secs(secs).ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }

    pub(crate) fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
        let whole = secs.trunc() as i64;
        let micros = ((secs - whole as f64) * 1_000_000.0).round() as u32;
        Utc.timestamp_opt(whole, micros.saturating_mul(1_000)).single()
    }
}

/// Serialize an `Option<DateTime<Utc>>` as optional fractional Unix seconds.
pub mod unix_seconds_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        ts.map(|t| t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1_000_000.0)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            None => Ok(None),
            Some(v) => super::unix_seconds::from_secs(v)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Review,
    Critique,
    Synthesizing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition further (except an explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses in which the task has an owning agent.
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            TaskStatus::Claimed
                | TaskStatus::Review
                | TaskStatus::Critique
                | TaskStatus::Synthesizing
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Failed -> Pending` and `Cancelled -> Pending` exist only for the
    /// explicit retry operation; every other mutation on a terminal task is
    /// rejected by the board.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Claimed)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Claimed, Review)
                | (Claimed, Completed)
                | (Claimed, Synthesizing)
                | (Claimed, Pending)
                | (Claimed, Paused)
                | (Claimed, Cancelled)
                | (Claimed, Failed)
                | (Review, Completed)
                | (Review, Critique)
                | (Review, Cancelled)
                | (Review, Failed)
                | (Critique, Claimed)
                | (Critique, Cancelled)
                | (Critique, Failed)
                | (Synthesizing, Completed)
                | (Synthesizing, Cancelled)
                | (Synthesizing, Failed)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Paused, Failed)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Review => "review",
            TaskStatus::Critique => "critique",
            TaskStatus::Synthesizing => "synthesizing",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Complexity
// ---------------------------------------------------------------------------

/// Gates the critique stage: `simple` tasks complete without review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Normal,
    Complex,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Normal
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Normal => write!(f, "normal"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSource
// ---------------------------------------------------------------------------

/// Provenance of a task: which channel and user it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    pub channel: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    /// The original user text, verbatim.
    #[serde(default)]
    pub text: String,
}

impl TaskSource {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: String::new(),
            user_id: String::new(),
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Critique model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CritiqueVerdict {
    #[serde(rename = "LGTM")]
    Lgtm,
    #[serde(rename = "NEEDS_WORK")]
    NeedsWork,
}

/// Five integer dimensions in [1,10].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueDimensions {
    pub accuracy: u8,
    pub completeness: u8,
    pub technical: u8,
    pub calibration: u8,
    pub efficiency: u8,
}

impl Default for CritiqueDimensions {
    fn default() -> Self {
        Self {
            accuracy: 7,
            completeness: 7,
            technical: 7,
            calibration: 7,
            efficiency: 7,
        }
    }
}

impl CritiqueDimensions {
    /// (name, score, weight) triples in a fixed order.
    pub fn weighted(&self) -> [(&'static str, u8, f64); 5] {
        [
            ("accuracy", self.accuracy, 0.30),
            ("completeness", self.completeness, 0.20),
            ("technical", self.technical, 0.20),
            ("calibration", self.calibration, 0.20),
            ("efficiency", self.efficiency, 0.10),
        ]
    }

    /// Weighted composite score in [1,10].
    pub fn composite(&self) -> f64 {
        self.weighted()
            .iter()
            .map(|(_, score, weight)| f64::from(*score) * weight)
            .sum()
    }

    pub fn all_high(&self) -> bool {
        self.weighted().iter().all(|(_, score, _)| *score >= 8)
    }

    pub fn any_low(&self) -> bool {
        self.weighted().iter().any(|(_, score, _)| *score < 5)
    }

    /// Dimensions scoring below 5, by name.
    pub fn low_dimensions(&self) -> Vec<&'static str> {
        self.weighted()
            .iter()
            .filter(|(_, score, _)| *score < 5)
            .map(|(name, _, _)| *name)
            .collect()
    }

    /// Clamp every dimension into [1,10].
    pub fn clamp(&mut self) {
        for score in [
            &mut self.accuracy,
            &mut self.completeness,
            &mut self.technical,
            &mut self.calibration,
            &mut self.efficiency,
        ] {
            *score = (*score).clamp(1, 10);
        }
    }
}

/// One actionable improvement item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CritiqueItem {
    #[serde(default)]
    pub dimension: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Structured review: dimension scores, verdict, and at most three items.
///
/// The reviewer is an advisor, never a gatekeeper - a `NEEDS_WORK` verdict
/// drives at most one revision round and never blocks completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueSpec {
    #[serde(default)]
    pub dimensions: CritiqueDimensions,
    pub verdict: CritiqueVerdict,
    #[serde(default)]
    pub items: Vec<CritiqueItem>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub reviewer_id: String,
    #[serde(default, with = "unix_seconds_opt")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_confidence() -> f64 {
    0.8
}

impl CritiqueSpec {
    pub fn lgtm() -> Self {
        Self {
            dimensions: CritiqueDimensions::default(),
            verdict: CritiqueVerdict::Lgtm,
            items: Vec::new(),
            confidence: default_confidence(),
            task_id: String::new(),
            reviewer_id: String::new(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn composite_score(&self) -> f64 {
        self.dimensions.composite()
    }

    /// Enforce the protocol rules, adjusting the critique in place:
    ///
    /// - dimensions clamped into [1,10], confidence into [0,1], items ≤ 3;
    /// - all dimensions ≥ 8 ⇒ verdict `LGTM` and items emptied;
    /// - any dimension < 5 ⇒ verdict `NEEDS_WORK` with an item naming it.
    pub fn normalize(&mut self) {
        self.dimensions.clamp();
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.items.truncate(3);

        if self.dimensions.all_high() {
            self.verdict = CritiqueVerdict::Lgtm;
            self.items.clear();
            return;
        }

        if self.dimensions.any_low() {
            self.verdict = CritiqueVerdict::NeedsWork;
            for dim in self.dimensions.low_dimensions() {
                if !self.items.iter().any(|i| i.dimension == dim) && self.items.len() < 3 {
                    self.items.push(CritiqueItem {
                        dimension: dim.to_string(),
                        issue: format!("{} scored below 5", dim),
                        suggestion: String::new(),
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub required_role: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub min_reputation: i32,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub critique: Option<CritiqueSpec>,
    #[serde(default)]
    pub critique_round: u32,
    #[serde(default)]
    pub evolution_flags: Vec<String>,
    #[serde(with = "unix_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "unix_seconds_opt")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the task entered `review`; drives the review staleness window.
    #[serde(default, with = "unix_seconds_opt")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, with = "unix_seconds_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<TaskSource>,
}

/// Parameters for creating a new task on the board.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub required_role: Option<String>,
    pub blocked_by: Vec<String>,
    pub min_reputation: i32,
    pub complexity: Complexity,
    pub parent_id: Option<String>,
    pub source: Option<TaskSource>,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    pub fn with_blockers(mut self, blockers: Vec<String>) -> Self {
        self.blocked_by = blockers;
        self
    }

    pub fn with_min_reputation(mut self, min: i32) -> Self {
        self.min_reputation = min;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = Some(source);
        self
    }
}

impl Task {
    pub(crate) fn from_new(new: NewTask) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: new.description,
            status: TaskStatus::Pending,
            required_role: new.required_role,
            agent_id: None,
            parent_id: new.parent_id,
            blocked_by: new.blocked_by,
            min_reputation: new.min_reputation,
            complexity: new.complexity,
            result: None,
            critique: None,
            critique_round: 0,
            evolution_flags: Vec::new(),
            created_at: Utc::now(),
            claimed_at: None,
            submitted_at: None,
            completed_at: None,
            source: new.source,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Review.is_terminal());
    }

    #[test]
    fn owned_statuses_match_invariant() {
        for status in [
            TaskStatus::Claimed,
            TaskStatus::Review,
            TaskStatus::Critique,
            TaskStatus::Synthesizing,
        ] {
            assert!(status.is_owned());
        }
        for status in [
            TaskStatus::Pending,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(!status.is_owned());
        }
    }

    #[test]
    fn completed_never_transitions() {
        use TaskStatus::*;
        for target in [
            Pending,
            Claimed,
            Review,
            Critique,
            Synthesizing,
            Paused,
            Failed,
            Cancelled,
        ] {
            assert!(!Completed.can_transition_to(&target));
        }
    }

    #[test]
    fn retry_transitions_exist() {
        assert!(TaskStatus::Failed.can_transition_to(&TaskStatus::Pending));
        assert!(TaskStatus::Cancelled.can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn composite_is_weighted_sum() {
        let dims = CritiqueDimensions {
            accuracy: 10,
            completeness: 8,
            technical: 6,
            calibration: 4,
            efficiency: 2,
        };
        let expected = 10.0 * 0.30 + 8.0 * 0.20 + 6.0 * 0.20 + 4.0 * 0.20 + 2.0 * 0.10;
        assert!((dims.composite() - expected).abs() < 1e-9);
    }

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = CritiqueDimensions::default()
            .weighted()
            .iter()
            .map(|(_, _, w)| w)
            .sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_all_high_forces_lgtm() {
        let mut critique = CritiqueSpec {
            dimensions: CritiqueDimensions {
                accuracy: 9,
                completeness: 8,
                technical: 10,
                calibration: 8,
                efficiency: 8,
            },
            verdict: CritiqueVerdict::NeedsWork,
            items: vec![CritiqueItem::default()],
            ..CritiqueSpec::lgtm()
        };
        critique.normalize();
        assert_eq!(critique.verdict, CritiqueVerdict::Lgtm);
        assert!(critique.items.is_empty());
    }

    #[test]
    fn normalize_low_dimension_forces_needs_work_with_item() {
        let mut critique = CritiqueSpec {
            dimensions: CritiqueDimensions {
                accuracy: 4,
                ..CritiqueDimensions::default()
            },
            verdict: CritiqueVerdict::Lgtm,
            items: Vec::new(),
            ..CritiqueSpec::lgtm()
        };
        critique.normalize();
        assert_eq!(critique.verdict, CritiqueVerdict::NeedsWork);
        assert!(critique.items.iter().any(|i| i.dimension == "accuracy"));
    }

    #[test]
    fn normalize_caps_items_at_three() {
        let mut critique = CritiqueSpec {
            items: vec![CritiqueItem::default(); 5],
            ..CritiqueSpec::lgtm()
        };
        critique.dimensions.accuracy = 6;
        critique.normalize();
        assert!(critique.items.len() <= 3);
    }

    #[test]
    fn timestamps_round_trip_as_unix_seconds() {
        let task = Task::from_new(NewTask::new("do something"));
        let json = serde_json::to_value(&task).unwrap();
        assert!(json["created_at"].is_f64() || json["created_at"].is_number());

        let parsed: Task = serde_json::from_value(json).unwrap();
        let delta = (parsed.created_at - task.created_at).num_milliseconds().abs();
        assert!(delta <= 1, "lost more than 1ms in round trip: {delta}ms");
    }

    #[test]
    fn verdict_serializes_as_wire_names() {
        assert_eq!(
            serde_json::to_string(&CritiqueVerdict::Lgtm).unwrap(),
            "\"LGTM\""
        );
        assert_eq!(
            serde_json::to_string(&CritiqueVerdict::NeedsWork).unwrap(),
            "\"NEEDS_WORK\""
        );
    }
}
