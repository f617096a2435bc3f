use thiserror::Error;

pub mod cfg;
pub mod jumptable;
pub mod pattern;
pub mod slicing;
pub mod tree;
pub mod usedef;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown conditional mnemonic: {0}")]
    UnknownMnemonic(String),
}
