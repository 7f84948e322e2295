#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hub error: {0}")]
    Hub(#[from] hub_client::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type FeedResult<T> = Result<T, FeedError>;
