//! Reviewer-side critique handling: prompt assembly and response parsing.
//!
//! The reviewer scores an executor's output on five weighted dimensions and
//! returns a verdict. It is an advisor, not a gatekeeper - the board caps
//! revisions at one round, so a critique can never block completion.

use relay_core::types::CritiqueSpec;

#[derive(Debug, thiserror::Error)]
pub enum CritiqueError {
    #[error("no JSON object in critique response")]
    NoJson,
    #[error("critique JSON invalid: {0}")]
    Invalid(String),
}

/// Build the scoring prompt for a critique request.
///
/// `intent` is the original user ask (from the context bus intent anchor)
/// so the reviewer judges the sub-task against what the user actually
/// wanted, not just the ticket text.
pub fn build_critique_prompt(intent: Option<&str>, description: &str, result: &str) -> String {
    let intent_section = intent
        .map(|text| format!("## Original User Intent\n{text}\n\n"))
        .unwrap_or_default();

    format!(
        "Score this subtask output using 5 dimensions (1-10 each).\n\n\
         {intent_section}\
         ## Subtask\n{description}\n\n\
         ## Output\n{result}\n\n\
         IMPORTANT: This is a SUBTASK result (raw data/code), NOT a final user-facing answer.\n\
         The planner will synthesize all subtask results into the final response.\n\
         Judge each dimension independently.\n\n\
         Respond with JSON:\n\
         {{\"dimensions\": {{\"accuracy\": <1-10>, \"completeness\": <1-10>, \
         \"technical\": <1-10>, \"calibration\": <1-10>, \"efficiency\": <1-10>}}, \
         \"verdict\": \"LGTM\" or \"NEEDS_WORK\", \
         \"items\": [{{\"dimension\": \"...\", \"issue\": \"...\", \"suggestion\": \"...\"}}], \
         \"confidence\": <0.0-1.0>}}\n\n\
         Rules:\n\
         - Weights: accuracy 30%, completeness 20%, technical 20%, calibration 20%, efficiency 10%\n\
         - If ALL scores >= 8: verdict MUST be LGTM, items MUST be empty []\n\
         - Max 3 items. Only for dimensions scoring < 8.\n\
         - If any score < 5: verdict MUST be NEEDS_WORK with item for that dimension.\n"
    )
}

/// Build the revision prompt an executor runs after a `NEEDS_WORK` verdict.
pub fn build_revision_prompt(description: &str, previous_result: &str, critique: &CritiqueSpec) -> String {
    let mut items = String::new();
    for item in &critique.items {
        items.push_str(&format!(
            "- [{}] {}",
            if item.dimension.is_empty() {
                "general"
            } else {
                &item.dimension
            },
            item.issue
        ));
        if !item.suggestion.is_empty() {
            items.push_str(&format!(" - suggestion: {}", item.suggestion));
        }
        items.push('\n');
    }

    format!(
        "Your previous output was reviewed and needs one revision.\n\n\
         ## Task\n{description}\n\n\
         ## Your previous output\n{previous_result}\n\n\
         ## Review items to address\n{items}\n\
         Produce the revised output in full. This is the final round."
    )
}

/// Parse the reviewer model's raw response into a normalized critique.
///
/// Tolerates markdown wrapping and prose around the JSON by extracting the
/// outermost `{...}` object; the result is run through the protocol rules
/// (clamping, verdict consistency, item cap).
pub fn parse_critique(raw: &str) -> Result<CritiqueSpec, CritiqueError> {
    let start = raw.find('{').ok_or(CritiqueError::NoJson)?;
    let end = raw.rfind('}').ok_or(CritiqueError::NoJson)?;
    if end < start {
        return Err(CritiqueError::NoJson);
    }
    let json = &raw[start..=end];

    let mut critique: CritiqueSpec =
        serde_json::from_str(json).map_err(|e| CritiqueError::Invalid(e.to_string()))?;
    critique.normalize();
    Ok(critique)
}

/// A safe fallback when the reviewer model's reply cannot be parsed: mid
/// scores, LGTM, low confidence. The pipeline keeps moving.
pub fn fallback_critique() -> CritiqueSpec {
    let mut critique = CritiqueSpec::lgtm();
    critique.confidence = 0.3;
    critique
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
