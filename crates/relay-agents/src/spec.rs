//! Structured sub-task tickets from planner to executor.
//!
//! Planner output is parsed through a ladder of formats, most structured
//! first:
//!
//! 1. fenced ```` ```subtask ```` JSON blocks (one spec per block);
//! 2. bare `{"objective": ...}` JSON objects;
//! 3. legacy `TASK:` / `COMPLEXITY:` line pairs.
//!
//! Malformed JSON gets one best-effort quote-repair pass before being
//! dropped. At most three sub-tasks survive extraction; the first spec
//! records a merge note naming the dropped objectives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use relay_core::types::Complexity;

/// Hard cap on sub-tasks per decomposition.
pub const MAX_SUBTASKS: usize = 3;

// ---------------------------------------------------------------------------
// SubTaskSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    MarkdownTable,
    Json,
    Code,
    File,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub objective: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub input: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Tool categories the executor should prefer.
    #[serde(default)]
    pub tool_hint: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Original user text, carried so executors never lose the intent.
    #[serde(default)]
    pub parent_intent: String,
    /// External-delegation metadata, opaque to the core.
    #[serde(default)]
    pub a2a_hint: BTreeMap<String, serde_json::Value>,
}

impl SubTaskSpec {
    pub fn from_objective(objective: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            objective: objective.into(),
            constraints: Vec::new(),
            input: BTreeMap::new(),
            output_format: OutputFormat::default(),
            tool_hint: Vec::new(),
            complexity,
            parent_intent: String::new(),
            a2a_hint: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("sub-task spec is always serializable")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize into a task's `description` field.
    pub fn to_task_description(&self) -> String {
        self.to_json()
    }

    /// Parse a task description back into a spec, when it carries one.
    pub fn from_task_description(description: &str) -> Option<Self> {
        Self::from_json(description.trim()).ok()
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Parse planner output into sub-task specs via the format ladder.
pub fn extract_specs(planner_output: &str) -> Vec<SubTaskSpec> {
    let fenced = extract_fenced_specs(planner_output);
    if !fenced.is_empty() {
        tracing::info!(count = fenced.len(), "parsed sub-task specs from fenced blocks");
        return fenced;
    }

    let bare = extract_bare_json_specs(planner_output);
    if !bare.is_empty() {
        tracing::info!(count = bare.len(), "parsed sub-task specs from bare JSON");
        return bare;
    }

    let legacy = extract_legacy_specs(planner_output);
    if legacy.is_empty() {
        let excerpt: String = planner_output.chars().take(500).collect();
        tracing::warn!(
            chars = planner_output.len(),
            excerpt = %excerpt,
            "no sub-task specs found in planner output"
        );
    } else {
        tracing::info!(count = legacy.len(), "parsed sub-task specs from legacy lines");
    }
    legacy
}

/// Cap the spec list at [`MAX_SUBTASKS`], recording dropped objectives as a
/// merge note on the first spec.
pub fn cap_specs(mut specs: Vec<SubTaskSpec>) -> Vec<SubTaskSpec> {
    if specs.len() <= MAX_SUBTASKS {
        return specs;
    }
    let dropped: Vec<String> = specs
        .split_off(MAX_SUBTASKS)
        .into_iter()
        .map(|s| s.objective)
        .collect();
    tracing::warn!(dropped = dropped.len(), "sub-task cap reached, merging excess");
    if let Some(first) = specs.first_mut() {
        first
            .constraints
            .push(format!("MERGE_NOTE: also covers: {}", dropped.join("; ")));
    }
    specs
}

fn extract_fenced_specs(text: &str) -> Vec<SubTaskSpec> {
    let mut specs = Vec::new();
    let mut rest = text;

    while let Some(open) = find_subtask_fence(rest) {
        let after_fence = &rest[open..];
        let Some(body_start) = after_fence.find('\n') else {
            break;
        };
        let body = &after_fence[body_start + 1..];
        let Some(close) = body.find("```") else {
            break;
        };
        let raw = body[..close].trim();
        match parse_spec_with_repair(raw) {
            Some(spec) => specs.push(spec),
            None => {
                let excerpt: String = raw.chars().take(100).collect();
                tracing::warn!(excerpt = %excerpt, "failed to parse fenced sub-task spec");
            }
        }
        rest = &body[close + 3..];
    }
    specs
}

/// Locate the next ```` ```subtask ```` opener, tolerating a space between
/// the backticks and the tag.
fn find_subtask_fence(text: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find("```") {
        let at = search_from + pos;
        let tag = text[at + 3..].trim_start_matches(' ');
        if tag.starts_with("subtask") {
            return Some(at);
        }
        search_from = at + 3;
    }
    None
}

/// Scan for balanced `{...}` objects that contain an `"objective"` key.
fn extract_bare_json_specs(text: &str) -> Vec<SubTaskSpec> {
    let bytes = text.as_bytes();
    let mut specs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let Some(end) = balanced_object_end(text, i) else {
            i += 1;
            continue;
        };
        let candidate = &text[i..=end];
        if candidate.contains("\"objective\"") {
            if let Some(spec) = parse_spec_with_repair(candidate) {
                specs.push(spec);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    specs
}

/// Index of the `}` closing the object opened at `start`, respecting strings.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_legacy_specs(text: &str) -> Vec<SubTaskSpec> {
    let mut specs = Vec::new();
    let mut pending: Option<String> = None;

    for line in text.lines() {
        let mut stripped = line.trim();
        for prefix in ["- ", "* ", "• "] {
            if let Some(rest) = stripped.strip_prefix(prefix) {
                stripped = rest;
                break;
            }
        }

        let upper = stripped.to_uppercase();
        if upper.starts_with("COMPLEXITY:") {
            if let Some(description) = pending.take() {
                let tag = stripped["COMPLEXITY:".len()..].trim().to_lowercase();
                let complexity = match tag.as_str() {
                    // Legacy "simple" promoted - decomposed work still gets review.
                    "simple" | "normal" => Complexity::Normal,
                    "complex" => Complexity::Complex,
                    _ => infer_complexity(&description),
                };
                specs.push(SubTaskSpec::from_objective(description, complexity));
            }
            continue;
        }

        if let Some(description) = pending.take() {
            // TASK: line without a COMPLEXITY: follower.
            specs.push(SubTaskSpec::from_objective(
                description.clone(),
                infer_complexity(&description),
            ));
        }

        if upper.starts_with("TASK:") {
            let description = stripped["TASK:".len()..].trim();
            if !description.is_empty() {
                pending = Some(description.to_string());
            }
        }
    }

    if let Some(description) = pending {
        specs.push(SubTaskSpec::from_objective(
            description.clone(),
            infer_complexity(&description),
        ));
    }
    specs
}

fn parse_spec_with_repair(raw: &str) -> Option<SubTaskSpec> {
    if let Ok(spec) = SubTaskSpec::from_json(raw) {
        return Some(spec);
    }
    let repaired = repair_json_quotes(raw);
    SubTaskSpec::from_json(&repaired).ok()
}

/// One best-effort repair pass for the commonest model mistake: unescaped
/// double quotes inside string values. A quote inside a string is escaped
/// unless the next non-space character is structural (`,:}]`).
pub fn repair_json_quotes(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                match next {
                    Some(',') | Some(':') | Some('}') | Some(']') | None => {
                        in_string = false;
                        out.push(ch);
                    }
                    _ => out.push_str("\\\""),
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Route override
// ---------------------------------------------------------------------------

/// An explicit route declared by the planner in its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOverride {
    /// The planner's own text is the final answer; skip decomposition.
    DirectAnswer,
    Pipeline,
}

/// Honor an explicit `ROUTE:` line in planner output, when present.
pub fn parse_route_override(planner_output: &str) -> Option<RouteOverride> {
    for line in planner_output.lines() {
        let stripped = line.trim();
        let Some(rest) = stripped
            .strip_prefix("ROUTE:")
            .or_else(|| stripped.strip_prefix("route:"))
        else {
            continue;
        };
        match rest.trim().to_uppercase().as_str() {
            "DIRECT_ANSWER" => return Some(RouteOverride::DirectAnswer),
            "PIPELINE" | "MAS_PIPELINE" => return Some(RouteOverride::Pipeline),
            other => {
                tracing::warn!(route = other, "unrecognized route override");
            }
        }
    }
    None
}

/// Strip `ROUTE:` declaration lines from planner output before delivery.
pub fn strip_route_lines(planner_output: &str) -> String {
    planner_output
        .lines()
        .filter(|line| {
            let stripped = line.trim();
            !stripped.starts_with("ROUTE:") && !stripped.starts_with("route:")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Infer the required agent role from a sub-task objective.
/// Review keywords win over planner keywords (so "review the plan" routes
/// to the reviewer), everything else goes to the executor.
pub fn infer_role(objective: &str) -> &'static str {
    let lower = objective.to_lowercase();

    if ["review", "evaluate", "audit", "verify"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return "review";
    }
    if ["plan", "decompose", "architect", "outline", "synthesize"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return "planner";
    }
    "implement"
}

/// Infer complexity from an objective. Conservative: most work goes through
/// review; `simple` is reserved for trivial read-only phrases.
pub fn infer_complexity(objective: &str) -> Complexity {
    let lower = objective.to_lowercase();

    if let Some(pos) = lower.find("complexity:") {
        let tag = lower[pos + "complexity:".len()..].trim_start();
        if tag.starts_with("simple") {
            return Complexity::Simple;
        }
        if tag.starts_with("complex") {
            return Complexity::Complex;
        }
        if tag.starts_with("normal") {
            return Complexity::Normal;
        }
    }

    if [
        "review",
        "audit",
        "verify",
        "analyze",
        "evaluate",
        "compare",
        "research",
        "investigate",
        "design",
        "architect",
    ]
    .iter()
    .any(|kw| lower.contains(kw))
    {
        return Complexity::Complex;
    }

    if ["print hello", "echo ", "list directory"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Complexity::Simple;
    }

    Complexity::Normal
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
