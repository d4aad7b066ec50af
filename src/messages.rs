//! Prompt synthesis for load generation.
//!
//! Two generators behind one interface: `Random` fills a user message with
//! random English words until a target context-token count is reached,
//! `Replay` samples message lists from a JSON file. Both can prepend a
//! varying timestamp prefix to every message to defeat server-side prompt
//! caching.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::error::GaleError;
use crate::tokens::count_message_tokens;

/// One element of the request `messages` array, and of each replay-file
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Timestamp prefixes like `"1704441942.868042 "` cost 8 tokens per
/// message for the GPT tokenizers.
const ANTICACHE_TOKENS_PER_MESSAGE: usize = 8;

fn anticache_prefix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06} ", now.as_secs(), now.subsec_micros())
}

/// Returns a copy of `messages` with a fresh anticache prefix on every
/// content, and the token count adjusted for the prefix cost.
fn add_anticache_prefix(
    messages: &[ChatMessage],
    tokens: usize,
) -> (Vec<ChatMessage>, usize) {
    let prefixed = messages
        .iter()
        .map(|message| ChatMessage {
            role: message.role.clone(),
            content: format!("{}{}", anticache_prefix(), message.content),
        })
        .collect::<Vec<_>>();
    let adjusted = tokens + ANTICACHE_TOKENS_PER_MESSAGE * messages.len();
    (prefixed, adjusted)
}

/// Strips the leading whitespace-separated token from every content and
/// re-counts. Inverse of `add_anticache_prefix` for caching the template.
fn remove_anticache_prefix(
    messages: &[ChatMessage],
    model: &str,
) -> Result<(Vec<ChatMessage>, usize), GaleError> {
    let stripped = messages
        .iter()
        .map(|message| ChatMessage {
            role: message.role.clone(),
            content: message
                .content
                .split_whitespace()
                .skip(1)
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect::<Vec<_>>();
    let tokens = count_message_tokens(&stripped, model)?;
    Ok((stripped, tokens))
}

fn random_words(amount: usize) -> String {
    let mut rng = rand::rng();
    let mut words = Vec::with_capacity(amount);
    for _ in 0..amount {
        words.push(*WORD_POOL.choose(&mut rng).unwrap_or(&"word"));
    }
    words.join(" ")
}

/// Produces `(messages, context_token_count)` pairs for the executor.
pub enum MessageGenerator {
    Random(RandomMessagesGenerator),
    Replay(ReplayMessagesGenerator),
}

impl MessageGenerator {
    pub fn generate(&self) -> (Vec<ChatMessage>, usize) {
        match self {
            Self::Random(generator) => generator.generate(),
            Self::Replay(generator) => generator.generate(),
        }
    }
}

/// Synthesizes a prompt of a target context-token length out of random
/// English words, once, and reuses the template for every request.
pub struct RandomMessagesGenerator {
    prevent_server_caching: bool,
    template: (Vec<ChatMessage>, usize),
}

impl RandomMessagesGenerator {
    /// Builds the cached template. The fill loop measures with the
    /// anticache prefix in place so the per-request token count stays
    /// accurate once fresh prefixes are substituted.
    pub fn new(
        model: &str,
        context_tokens: usize,
        max_tokens: Option<u64>,
        prevent_server_caching: bool,
    ) -> Result<Self, GaleError> {
        tracing::info!("warming up prompt cache");
        let mut messages = vec![ChatMessage::user("")];
        if let Some(max_tokens) = max_tokens {
            messages.push(ChatMessage::user(format!(
                "write a long essay about life in at least {max_tokens} tokens"
            )));
        }
        if prevent_server_caching {
            let initial = count_message_tokens(&messages, model)?;
            (messages, _) = add_anticache_prefix(&messages, initial);
        }

        let base = messages[0].content.clone();
        let mut filler = String::new();
        let mut tokens = count_message_tokens(&messages, model)?;
        while tokens < context_tokens {
            // Random words run ~4 tokens each at most; overshoot stays
            // within one iteration's granularity.
            let amount = (context_tokens - tokens).div_ceil(4);
            filler.push_str(&random_words(amount));
            filler.push(' ');
            messages[0].content = format!("{base}{filler}");
            tokens = count_message_tokens(&messages, model)?;
        }

        if prevent_server_caching {
            (messages, tokens) = remove_anticache_prefix(&messages, model)?;
        }
        Ok(Self {
            prevent_server_caching,
            template: (messages, tokens),
        })
    }

    pub fn generate(&self) -> (Vec<ChatMessage>, usize) {
        let (messages, tokens) = &self.template;
        if self.prevent_server_caching {
            add_anticache_prefix(messages, *tokens)
        } else {
            (messages.clone(), *tokens)
        }
    }
}

/// Samples prompts uniformly from a replay file: a JSON array of
/// `messages` arrays, token counts pre-computed at load.
#[derive(Debug)]
pub struct ReplayMessagesGenerator {
    prevent_server_caching: bool,
    entries: Vec<(Vec<ChatMessage>, usize)>,
}

impl ReplayMessagesGenerator {
    pub fn new(
        model: &str,
        path: &Path,
        prevent_server_caching: bool,
    ) -> Result<Self, GaleError> {
        tracing::info!(path = %path.display(), "loading messages from file");
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GaleError::ReplayFile(e.to_string()))?;
        let all_messages_lists: Vec<Vec<ChatMessage>> = serde_json::from_str(&raw)
            .map_err(|e| {
                GaleError::ReplayFile(format!(
                    "replay file must contain a JSON array of messages lists: {e}"
                ))
            })?;
        if all_messages_lists.is_empty() {
            return Err(GaleError::ReplayFile(
                "replay file must contain at least one list of messages".to_string(),
            ));
        }
        if all_messages_lists.iter().any(Vec::is_empty) {
            return Err(GaleError::ReplayFile(
                "replay file contains an empty messages list".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(all_messages_lists.len());
        for messages in all_messages_lists {
            let tokens = count_message_tokens(&messages, model)?;
            entries.push((messages, tokens));
        }
        Ok(Self {
            prevent_server_caching,
            entries,
        })
    }

    pub fn generate(&self) -> (Vec<ChatMessage>, usize) {
        let mut rng = rand::rng();
        let (messages, tokens) = self
            .entries
            .choose(&mut rng)
            .expect("entries checked non-empty at construction");
        if self.prevent_server_caching {
            add_anticache_prefix(messages, *tokens)
        } else {
            (messages.clone(), *tokens)
        }
    }
}

const WORD_POOL: &[&str] = &[
    "able", "about", "above", "across", "action", "activity", "actually", "after",
    "again", "against", "almost", "alone", "along", "already", "although", "always",
    "amount", "animal", "another", "answer", "anything", "appear", "area", "around",
    "arrive", "attention", "autumn", "balance", "barely", "beautiful", "because",
    "become", "before", "begin", "behind", "believe", "below", "between", "beyond",
    "bird", "board", "both", "bottom", "branch", "bread", "breath", "bridge",
    "bright", "bring", "brother", "build", "busy", "calm", "care", "carry",
    "center", "certain", "chance", "change", "child", "choose", "circle", "city",
    "clean", "clear", "climb", "close", "cloud", "cold", "color", "common",
    "complete", "consider", "contain", "continue", "corner", "correct", "country",
    "course", "cover", "create", "cross", "crowd", "current", "dance", "dark",
    "decide", "deep", "desert", "design", "detail", "develop", "different",
    "direction", "discover", "distance", "divide", "doctor", "double", "doubt",
    "dream", "drive", "early", "earth", "easy", "edge", "effect", "effort",
    "either", "energy", "enough", "enter", "entire", "evening", "every", "exact",
    "example", "except", "expect", "experience", "explain", "express", "fall",
    "family", "famous", "field", "figure", "final", "finger", "finish", "first",
    "flower", "follow", "force", "forest", "forget", "form", "forward", "found",
    "fresh", "friend", "front", "fruit", "further", "future", "garden", "gather",
    "general", "gentle", "glass", "govern", "grass", "great", "green", "ground",
    "group", "grow", "guess", "half", "happen", "heavy", "history", "hold",
    "hope", "hour", "however", "human", "hundred", "hurry", "idea", "imagine",
    "important", "include", "indeed", "inside", "instead", "interest", "island",
    "journey", "just", "keep", "kind", "know", "language", "large", "later",
    "laugh", "learn", "leave", "length", "letter", "level", "light", "listen",
    "little", "long", "machine", "main", "major", "manage", "market", "matter",
    "measure", "meet", "member", "memory", "middle", "might", "mind", "minute",
    "moment", "morning", "mountain", "move", "music", "natural", "nature", "near",
    "never", "night", "north", "nothing", "notice", "number", "object", "ocean",
    "offer", "often", "open", "order", "other", "outside", "over", "page",
    "paper", "part", "pass", "past", "pattern", "people", "perhaps", "period",
    "person", "picture", "piece", "place", "plain", "plan", "plant", "point",
    "position", "possible", "power", "present", "press", "probable", "problem",
    "produce", "provide", "public", "purpose", "question", "quick", "quiet",
    "quite", "raise", "rather", "reach", "ready", "real", "reason", "receive",
    "record", "region", "remain", "remember", "repeat", "reply", "report",
    "represent", "require", "rest", "result", "return", "river", "road", "rock",
    "room", "round", "rule", "same", "school", "science", "season", "second",
    "section", "sense", "sentence", "serve", "settle", "several", "shape",
    "share", "sharp", "short", "should", "shoulder", "side", "sign", "silent",
    "simple", "since", "single", "sister", "small", "smile", "soft", "some",
    "song", "soon", "sound", "south", "space", "speak", "special", "spend",
    "spring", "stand", "start", "state", "station", "steel", "still", "stone",
    "story", "straight", "strange", "stream", "street", "strong", "study",
    "subject", "sudden", "summer", "supply", "support", "sure", "surface",
    "system", "table", "teach", "team", "temper", "thing", "think", "though",
    "thought", "through", "time", "today", "together", "toward", "travel",
    "tree", "trouble", "true", "turn", "under", "understand", "until", "usual",
    "value", "various", "very", "village", "visit", "voice", "wait", "walk",
    "warm", "watch", "water", "weather", "week", "weight", "west", "wheel",
    "where", "whether", "which", "while", "white", "whole", "wind", "window",
    "winter", "wonder", "word", "work", "world", "write", "yellow", "young",
];
