use std::io;

#[derive(Debug, thiserror::Error)]
pub enum GrblError {
    #[error("timed out waiting for controller response")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, GrblError>;
