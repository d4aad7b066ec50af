//! The `tokenize` subcommand: counts tokens for text or chat messages.

use std::io::Read;

use crate::cli::TokenizeArgs;
use crate::error::GaleError;
use crate::messages::ChatMessage;
use crate::tokens::{count_message_tokens, count_text_tokens};

/// Counts tokens for the given input and model. Input that parses as a
/// JSON messages array is counted as chat messages, anything else as raw
/// text.
pub fn run(args: &TokenizeArgs) -> Result<(), GaleError> {
    let text = match &args.text {
        Some(text) => text.clone(),
        None => {
            tracing::info!("no input text given, reading stdin");
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| GaleError::Other(format!("failed reading stdin: {e}")))?;
            buffer
        }
    };

    let count = count(&text, &args.model)?;
    println!("tokens: {count}");
    Ok(())
}

fn count(text: &str, model: &str) -> Result<usize, GaleError> {
    match serde_json::from_str::<Vec<ChatMessage>>(text) {
        Ok(messages) => count_message_tokens(&messages, model),
        Err(_) => {
            tracing::info!("input does not seem to be json formatted, assuming text");
            count_text_tokens(text, model)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_messages_are_counted_as_chat() {
        let as_messages =
            count(r#"[{"role": "user", "content": "hello"}]"#, "gpt-4").unwrap();
        let as_text = count("hello", "gpt-4").unwrap();
        // Chat counting adds per-message framing on top of the content.
        assert!(as_messages > as_text);
    }

    #[test]
    fn non_json_input_falls_back_to_text() {
        let count = count("plain text, not json", "gpt-4").unwrap();
        assert!(count > 0);
    }

    #[test]
    fn json_that_is_not_a_messages_array_counts_as_text() {
        let count = count(r#"{"role": "user"}"#, "gpt-4").unwrap();
        assert!(count > 0);
    }
}
