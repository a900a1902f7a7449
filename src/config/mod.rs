use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod ast;
pub mod loader;
pub mod parser;


pub use ast::*;
pub use loader::load_config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
