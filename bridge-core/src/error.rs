use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Commit Error - {0}")]
    Commit(String),

    /// The partition assignment the caller holds is no longer current.
    #[error("Partition {0} Revoked")]
    Revoked(i32),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Dead Letter Error - {0}")]
    DeadLetter(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}
