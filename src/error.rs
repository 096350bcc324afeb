use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlertflowError {
    #[error("WebSocket error: {0}")]
    WebsocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid alert definition: {0}")]
    InvalidAlert(String),

    #[error("worker queue full (depth {0})")]
    QueueFull(usize),

    #[error("worker task {0} timed out")]
    TaskTimeout(u64),

    #[error("worker task failed: {0}")]
    WorkerFailed(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("feed unavailable after {0} reconnect attempts")]
    FeedUnavailable(u32),
}
