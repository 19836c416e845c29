/// Shared error type used across all SerialAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session busy: {0}")]
    Busy(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    #[error("provider fatal error: {0}")]
    ProviderFatal(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("canceled")]
    Canceled,

    #[error("storage degraded: {0}")]
    StorageDegraded(String),

    #[error("format error: {0}")]
    FormatError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The `{data:{...}}`-style HTTP status this error kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Busy(_) => 429,
            Error::SchemaError(_) => 400,
            Error::PermissionDenied(_) => 403,
            Error::Canceled => 499,
            Error::ProviderTransient(_) | Error::ProviderFatal(_) | Error::StorageDegraded(_) => {
                502
            }
            Error::Auth(_) => 401,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
