//! System prompt assembly.
//!
//! A worker's system prompt layers: role text, the optional soul/cognition
//! document, skill documents, the tool manifest, a context-bus snapshot,
//! memory recall, and the user profile - then truncates to the configured
//! character budget, keeping the head (role and skills outrank stale
//! context when space runs out).

use std::collections::BTreeMap;

use relay_bus::context::ContextEntry;
use relay_llm::provider::ToolSpec;

pub struct PromptInputs<'a> {
    pub role_text: &'a str,
    pub soul: Option<&'a str>,
    pub skills: &'a [String],
    pub tools: &'a [ToolSpec],
    pub context: &'a BTreeMap<String, ContextEntry>,
    pub memory: Option<&'a str>,
    pub user_profile: Option<&'a str>,
}

/// Assemble the system prompt within `budget_chars`.
pub fn build_system_prompt(inputs: &PromptInputs<'_>, budget_chars: usize) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(inputs.role_text.to_string());

    if let Some(soul) = inputs.soul {
        if !soul.is_empty() {
            sections.push(soul.to_string());
        }
    }

    if !inputs.skills.is_empty() {
        let mut block = String::from("## Skills\n");
        for skill in inputs.skills {
            block.push_str(skill);
            block.push('\n');
        }
        sections.push(block);
    }

    if !inputs.tools.is_empty() {
        let mut block = String::from("## Available Tools\n");
        for tool in inputs.tools {
            block.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        block.push_str(
            "Call a tool by responding with a tool call; results are fed back to you.\n",
        );
        sections.push(block);
    }

    if !inputs.context.is_empty() {
        let mut block = String::from("## Shared Context (from teammates)\n");
        for (key, entry) in inputs.context {
            let value = match &entry.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            block.push_str(&format!("- {key}: {value}\n"));
        }
        sections.push(block);
    }

    if let Some(memory) = inputs.memory {
        if !memory.is_empty() {
            sections.push(format!("## Relevant Memory\n{memory}"));
        }
    }

    if let Some(profile) = inputs.user_profile {
        if !profile.is_empty() {
            sections.push(format!("## User Profile\n{profile}"));
        }
    }

    truncate_to_budget(&sections.join("\n\n"), budget_chars)
}

/// Truncate at a char boundary, marking the cut.
pub fn truncate_to_budget(text: &str, budget_chars: usize) -> String {
    if text.chars().count() <= budget_chars {
        return text.to_string();
    }
    const MARKER: &str = "\n[...context truncated...]";
    let keep = budget_chars.saturating_sub(MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(MARKER);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_bus::context::{ContextLayer, Provenance};

    fn entry(value: &str) -> ContextEntry {
        ContextEntry {
            value: serde_json::json!(value),
            layer: ContextLayer::Short,
            ttl_seconds: None,
            timestamp: Utc::now(),
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn sections_appear_in_order() {
        let context: BTreeMap<String, ContextEntry> =
            [("planner:goal".to_string(), entry("ship v1"))]
                .into_iter()
                .collect();
        let tools = vec![ToolSpec {
            name: "shell".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({}),
        }];
        let skills = vec!["# Skill: summarize".to_string()];

        let prompt = build_system_prompt(
            &PromptInputs {
                role_text: "You are the executor.",
                soul: Some("Be precise."),
                skills: &skills,
                tools: &tools,
                context: &context,
                memory: Some("user prefers tables"),
                user_profile: None,
            },
            10_000,
        );

        let role_pos = prompt.find("You are the executor.").unwrap();
        let tools_pos = prompt.find("## Available Tools").unwrap();
        let context_pos = prompt.find("## Shared Context").unwrap();
        assert!(role_pos < tools_pos && tools_pos < context_pos);
        assert!(prompt.contains("planner:goal: ship v1"));
        assert!(prompt.contains("user prefers tables"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let context = BTreeMap::new();
        let prompt = build_system_prompt(
            &PromptInputs {
                role_text: "role",
                soul: None,
                skills: &[],
                tools: &[],
                context: &context,
                memory: None,
                user_profile: None,
            },
            1_000,
        );
        assert_eq!(prompt, "role");
    }

    #[test]
    fn budget_truncates_with_marker() {
        let long = "x".repeat(500);
        let truncated = truncate_to_budget(&long, 100);
        assert!(truncated.chars().count() <= 100);
        assert!(truncated.ends_with("[...context truncated...]"));
    }

    #[test]
    fn short_text_untouched() {
        assert_eq!(truncate_to_budget("short", 100), "short");
    }
}
