#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("codec error: {0}")]
    Codec(#[from] fulcrum_common::CodecError),
    #[error("malformed response payload: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    #[error("request timed out waiting for a reply")]
    Timeout,
}
