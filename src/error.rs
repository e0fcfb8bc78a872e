// Tue Jan 13 2026 - Alex

use thiserror::Error;

/// Frontend error taxonomy.  Every error is fatal at the point of
/// detection; only `main` turns these into a process exit.
#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("failed to parse {mode}; {message}")]
    Parse { mode: &'static str, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ELF error: {0}")]
    Elf(String),

    #[error("ELF parse error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("semantic error: {0}")]
    Semantic(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("limit exceeded: {0}")]
    Limit(String),
}

impl FrontendError {
    pub fn parse(mode: &'static str, message: impl Into<String>) -> Self {
        FrontendError::Parse {
            mode,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrontendError>;
