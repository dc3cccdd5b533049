//! Static system-prompt assembly. Mirrors the teacher's ordered-section
//! persona assembly: a base identity block, then mode-specific guidance,
//! then a tier note describing how much working context the session has,
//! joined in a fixed order rather than built ad hoc per call site.

use cce_schema::{Message, Mode, Tier};

const BASE_IDENTITY: &str = "You are a coding assistant running against a local model through ollm. \
Conversation history is actively managed: older turns may appear as compact \
checkpoint summaries instead of the original exchange. Treat a checkpoint as \
a faithful but lossy record of what happened.";

fn mode_guidance(mode: Mode) -> &'static str {
    match mode {
        Mode::Assistant => "Default mode: answer directly, keep a conversational tone, ask before taking destructive actions.",
        Mode::Developer => "Developer mode: prioritize correctness and working code over explanation. Show diffs and commands, not prose, unless asked.",
        Mode::Planning => "Planning mode: decompose the request into concrete steps before acting. Do not write code until the plan is confirmed.",
        Mode::Debugger => "Debugger mode: form a hypothesis before changing anything. State what you expect to observe and check it before moving on.",
        Mode::User => "User-authored mode: follow the custom instructions supplied for this session verbatim; fall back to assistant behavior where they are silent.",
    }
}

fn tier_note(tier: Tier) -> String {
    match tier {
        1 => "This session has a small context budget. Checkpoints age aggressively; expect older detail to compact quickly.".to_string(),
        2 => "This session has a limited context budget. Summaries of older turns will be terse.".to_string(),
        3 => "This session has a moderate context budget.".to_string(),
        4 => "This session has a generous context budget. Older turns stay detailed for longer before aging.".to_string(),
        _ => "This session has a large context budget. Checkpoint aging is conservative.".to_string(),
    }
}

const TOOL_UNSUPPORTED_NOTE: &str = "This model's profile is unrecognized or reports no tool support; \
tool-calling instructions do not apply here. Describe actions in plain text instead.";

/// Assembles the system prompt for `(mode, tier)`, appending a note when the
/// active model has no known tool support. Regenerated on every `set_mode`
/// and always spliced in at position 0 of the working prompt.
pub fn build_system_prompt(mode: Mode, tier: Tier, tool_support: bool) -> Message {
    let mut sections = vec![BASE_IDENTITY.to_string(), mode_guidance(mode).to_string(), tier_note(tier)];
    if !tool_support {
        sections.push(TOOL_UNSUPPORTED_NOTE.to_string());
    }
    Message::system(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_produces_a_nonempty_prompt() {
        for mode in [Mode::Assistant, Mode::Developer, Mode::Planning, Mode::Debugger, Mode::User] {
            let prompt = build_system_prompt(mode, 3, true);
            assert!(!prompt.text().is_empty());
        }
    }

    #[test]
    fn tool_unsupported_note_only_appears_when_flagged() {
        let with_tools = build_system_prompt(Mode::Assistant, 3, true);
        let without_tools = build_system_prompt(Mode::Assistant, 3, false);
        assert!(!with_tools.text().contains("no tool support"));
        assert!(without_tools.text().contains("no tool support"));
    }

    #[test]
    fn tier_note_varies_by_tier() {
        let low = build_system_prompt(Mode::Assistant, 1, true);
        let high = build_system_prompt(Mode::Assistant, 5, true);
        assert_ne!(low.text(), high.text());
    }
}
