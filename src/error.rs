pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the oauth flows and the spotify client.
///
/// Validation errors are raised before any writes happen. Provider errors
/// that occur mid-sequence (playlist created, tracks partially added) are
/// surfaced as-is without rolling back completed steps.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required parameters: {0}")]
    MissingParameters(&'static str),

    #[error("unknown oauth flow tag: {0}")]
    InvalidFlow(String),

    #[error("malformed oauth state payload")]
    InvalidState,

    #[error("invalid or expired nonce")]
    InvalidOrExpiredNonce,

    #[error("no linked spotify account for this identity")]
    AccountNotLinked,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("spotify api error: status {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("blob storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("http error: {0}")]
    Http(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<surf::Error> for Error {
    fn from(e: surf::Error) -> Self {
        Error::Http(e.to_string())
    }
}
