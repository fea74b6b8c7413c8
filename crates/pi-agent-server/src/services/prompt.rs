//! Outbound prompt composition.
//!
//! The backend receives a single text prompt made of tagged blocks:
//! a `<system>` block, the remembered turns, and the new `<user>` message.

use crate::services::conversation::Turn;

fn render_block(tag: &str, content: &str) -> String {
    format!("<{tag}>\n{content}\n</{tag}>")
}

/// Renders remembered turns, skipping empty ones. Anything that is not an
/// assistant turn is rendered as a user block.
fn render_history(history: &[Turn]) -> String {
    history
        .iter()
        .filter(|turn| !turn.content.is_empty())
        .map(|turn| {
            let tag = if turn.role.is_assistant() { "assistant" } else { "user" };
            render_block(tag, &turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(system: &str, message: &str, history: &[Turn]) -> String {
    let system_block = render_block("system", system);
    let user_block = render_block("user", message);
    let rendered = render_history(history);

    if rendered.is_empty() {
        format!("{system_block}\n\n{user_block}")
    } else {
        format!("{system_block}\n\n{rendered}\n\n{user_block}")
    }
}
