// Tue Jan 13 2026 - Alex

pub mod backend;
pub mod config;
pub mod csv;
pub mod elf;
pub mod error;
pub mod insn;
pub mod logging;
pub mod matcher;
pub mod metadata;
pub mod pipeline;
pub mod plugins;
pub mod rules;

pub use config::Config;
pub use elf::ElfImage;
pub use error::{FrontendError, Result};
pub use matcher::Evaluator;
pub use pipeline::Pipeline;
pub use plugins::PluginRegistry;
pub use rules::RuleCompiler;
