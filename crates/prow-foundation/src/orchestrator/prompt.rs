//! Conversation-to-prompt rendering for instruction-tuned QA models.
//!
//! Flattens an ordered list of chat turns plus optional retrieval context
//! into the single prompt string the backbone model was tuned on: a fixed
//! system preamble, the context block, a role-labeled transcript, and a
//! trailing `Assistant:` cue that tells the model to continue from an
//! assistant turn.

use super::types::{ChatMessage, ChatRole};

/// Fixed system preamble placed at the top of every formatted prompt.
pub const SYSTEM: &str = "System: This is a chat between a user and an artificial intelligence assistant. The assistant gives helpful, detailed, and polite answers to the user's questions based on the context. The assistant should also indicate when the answer cannot be found in the context.";

/// Instruction prepended to the first user turn of each request.
pub const INSTRUCTION: &str = "Please give a full and complete answer for the question.";

/// Cue appended after the transcript so generation resumes on the
/// assistant side rather than echoing the user turn.
pub const ASSISTANT_CUE: &str = "\n\nAssistant:";

/// Render a conversation plus optional context into one prompt string.
///
/// The first user turn is rewritten in place to carry [`INSTRUCTION`].
/// That mutation happens once per request by construction (requests own
/// their turns and are formatted exactly once); formatting the same slice
/// a second time prefixes the instruction again. Callers must not re-format
/// already-formatted turns.
///
/// There are no error conditions: an empty context or an empty turn list
/// still produces a (degenerate) prompt ending in the assistant cue.
pub fn format_input(messages: &mut [ChatMessage], context: &str) -> String {
    // Only the first user turn carries the instruction.
    for message in messages.iter_mut() {
        if message.role == ChatRole::User {
            message.content = format!("{} {}", INSTRUCTION, message.content);
            break;
        }
    }

    let conversation = messages
        .iter()
        .map(|message| match message.role {
            ChatRole::User => format!("User: {}", message.content),
            _ => format!("Assistant: {}", message.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{}\n\n{}\n\n{}{}", SYSTEM, context, conversation, ASSISTANT_CUE)
}
