#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("consumer stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;
