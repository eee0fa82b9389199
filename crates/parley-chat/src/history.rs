//! Wire history built from prior conversation turns

use parley_ai::{ChatMessage, HistoryMessage, HistoryRole, Part, Role};
use std::sync::Arc;

/// Map prior messages to the history sent with the next turn.
///
/// Keeps user and model turns only, keeps only their non-empty text parts,
/// and drops turns left with no text. Pass the list as it was before the new
/// user message and placeholder were appended.
pub fn build_history(messages: &[Arc<ChatMessage>]) -> Vec<HistoryMessage> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role {
                Role::User => HistoryRole::User,
                Role::Model => HistoryRole::Model,
                Role::Error => return None,
            };

            let parts: Vec<Part> = message
                .parts
                .iter()
                .filter_map(|p| p.as_text().filter(|t| !t.is_empty()))
                .map(Part::text)
                .collect();

            if parts.is_empty() {
                None
            } else {
                Some(HistoryMessage { role, parts })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arcs(messages: Vec<ChatMessage>) -> Vec<Arc<ChatMessage>> {
        messages.into_iter().map(Arc::new).collect()
    }

    #[test]
    fn test_keeps_user_and_model_text() {
        let history = build_history(&arcs(vec![
            ChatMessage::user("hi"),
            ChatMessage::model("hello", vec![]),
        ]));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, HistoryRole::User);
        assert_eq!(history[1].role, HistoryRole::Model);
        assert_eq!(history[1].parts, vec![Part::text("hello")]);
    }

    #[test]
    fn test_drops_error_messages() {
        let history = build_history(&arcs(vec![
            ChatMessage::user("hi"),
            ChatMessage::error("Server responded 500: boom"),
        ]));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_drops_placeholder_and_empty_text() {
        let history = build_history(&arcs(vec![
            ChatMessage::user("hi"),
            ChatMessage::placeholder(),
        ]));
        assert_eq!(history.len(), 1);
        assert!(history.iter().all(|h| h.parts.iter().all(Part::has_text)));
    }

    #[test]
    fn test_strips_image_parts() {
        let history = build_history(&arcs(vec![
            ChatMessage::user_with_parts(vec![
                Part::text("what is this?"),
                Part::inline("AAAA", "image/png"),
            ]),
            ChatMessage::model_with_parts(vec![Part::inline("BBBB", "image/png")]),
        ]));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].parts, vec![Part::text("what is this?")]);
    }

    #[test]
    fn test_empty_input() {
        assert!(build_history(&[]).is_empty());
    }
}
