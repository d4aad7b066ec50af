use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("error loading replay file: {0}")]
    ReplayFile(String),

    #[error("no tokenizer available for model: {0}")]
    Tokenizer(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl GaleError {
    /// True for errors caused by operator input rather than the run itself.
    /// These exit with code 1 before any load is generated.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::ReplayFile(_) | Self::Tokenizer(_)
        )
    }
}
