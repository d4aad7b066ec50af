//! Token counting for chat messages and raw text.
//!
//! Uses `tiktoken-rs` with the `cl100k_base` encoding, which covers the
//! gpt-3.5-turbo and gpt-4 families this tool targets.

use once_cell::sync::Lazy;
use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::error::GaleError;
use crate::messages::ChatMessage;

/// Fixed overhead per message in the chat completion wire format
/// (`<|start|>role<|separator|>...<|end|>`).
const TOKENS_PER_MESSAGE: usize = 3;

/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: usize = 3;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

fn encoder_for(model: &str) -> Result<&'static CoreBPE, GaleError> {
    if model.starts_with("gpt-4") || model.starts_with("gpt-3.5-turbo") {
        CL100K
            .as_ref()
            .ok_or_else(|| GaleError::Tokenizer(model.to_string()))
    } else {
        Err(GaleError::Tokenizer(model.to_string()))
    }
}

/// Count the context tokens a `messages` array consumes for `model`,
/// including per-message framing and reply priming.
pub fn count_message_tokens(
    messages: &[ChatMessage],
    model: &str,
) -> Result<usize, GaleError> {
    let bpe = encoder_for(model)?;
    let mut count = REPLY_PRIMING_TOKENS;
    for message in messages {
        count += TOKENS_PER_MESSAGE;
        count += bpe.encode_with_special_tokens(&message.role).len();
        count += bpe.encode_with_special_tokens(&message.content).len();
    }
    Ok(count)
}

/// Count tokens of raw text for `model`.
pub fn count_text_tokens(text: &str, model: &str) -> Result<usize, GaleError> {
    Ok(encoder_for(model)?.encode_with_special_tokens(text).len())
}
