use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Mesher error: {0}")]
    Mesher(String),
    #[error("Solver error: {0}")]
    Solver(String),
    #[error("Verification error: {0}")]
    Verification(String),
    #[error("Post Processor error: {0}")]
    PostProcessor(String),
}
