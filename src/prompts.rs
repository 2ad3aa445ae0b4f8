//! Prompt construction for the decision source.
//!
//! The system prompt pins the response contract (one JSON object, one
//! action from the registered palette); the per-step user message carries
//! the goal, the rendered history, and the current element listing.

use crate::schema::SCHEMA_VERSION;

const PARAMETER_DOCS: &str = r#"Available actions (respond with exactly one):
- {"kind": "navigate", "url": "<absolute url>"} - load a different page
- {"kind": "click-element", "element_index": <n>} - click the element numbered <n> in the listing
- {"kind": "type-text", "element_index": <n>, "text": "<text>", "press_enter_after": <bool, optional>} - focus the element and type into it
- {"kind": "scroll", "delta_y": <pixels, negative scrolls up>} - scroll the page
- {"kind": "extract-content", "element_index": <n, optional>} - read visible text from one element, or the whole page when omitted
- {"kind": "wait", "milliseconds": <n>} - pause briefly for the page to settle
- {"kind": "done", "message": "<final answer or summary>", "success": <bool, optional>} - finish the run; use this once the goal is satisfied or provably unreachable"#;

/// System prompt establishing the action contract.
pub fn build_system_prompt(kinds: &[&str]) -> String {
    format!(
        "You are a browser automation agent. Each turn you see the user's goal, a numbered \
listing of the interactive elements currently on the page, and a summary of the steps taken \
so far. Choose the single next action that makes the most progress toward the goal.\n\n\
{PARAMETER_DOCS}\n\n\
Action kinds enabled for this run: {}. (action schema v{SCHEMA_VERSION})\n\n\
Rules:\n\
- Respond with ONLY one JSON object, no prose and no code fences.\n\
- You may include an optional top-level \"rationale\" string explaining the choice; every \
other field must belong to the chosen action.\n\
- Element numbers are only valid for the listing shown this turn; never reuse numbers from \
earlier turns.\n\
- If the previous action failed, prefer a different approach over repeating it.\n\
- Declare {{\"kind\": \"done\"}} as soon as the goal is met; do not keep acting afterwards.",
        kinds.join(", ")
    )
}

/// Per-step user message: goal, history, page state.
pub fn build_step_message(
    goal: &str,
    page_url: &str,
    element_listing: &str,
    history_rendered: &str,
    last_validation_error: Option<&str>,
) -> String {
    let mut message = format!(
        "Goal: {goal}\n\nCurrent page: {page_url}\n\nInteractive elements:\n{element_listing}\n\
Steps so far:\n{history_rendered}"
    );
    if let Some(error) = last_validation_error {
        message.push_str(&format!(
            "\n\nYour previous response was rejected: {error}\nReturn a corrected action."
        ));
    }
    message
}
