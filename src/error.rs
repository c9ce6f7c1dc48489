use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("report download failed: {0}")]
    Io(#[from] std::io::Error),
}
