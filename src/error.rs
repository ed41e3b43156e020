use thiserror::Error;

/// Main error type for the custody service
#[derive(Error, Debug)]
pub enum CustodyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger precondition errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Insufficient UTXO: need {need} sat, have {have} sat")]
    InsufficientUtxo { need: u64, have: u64 },

    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("Already released: order {order_id}")]
    AlreadyReleased { order_id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent modification of wallet {0}")]
    ConcurrentModification(String),

    // External collaborators
    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    // Key material
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CustodyError
pub type Result<T> = std::result::Result<T, CustodyError>;

/// Stable, caller-facing classification of a [`CustodyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    InsufficientFunds,
    InsufficientUtxo,
    DuplicateEvent,
    AlreadyReleased,
    ExternalService,
    KeyDerivation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::InsufficientFunds => "insufficient_funds",
            Self::InsufficientUtxo => "insufficient_utxo",
            Self::DuplicateEvent => "duplicate_event",
            Self::AlreadyReleased => "already_released",
            Self::ExternalService => "external_service",
            Self::KeyDerivation => "key_derivation",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CustodyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CustodyError::NotFound(_) => ErrorKind::NotFound,
            CustodyError::InvalidInput(_) => ErrorKind::InvalidInput,
            CustodyError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            CustodyError::InsufficientUtxo { .. } => ErrorKind::InsufficientUtxo,
            CustodyError::DuplicateEvent(_) => ErrorKind::DuplicateEvent,
            CustodyError::AlreadyReleased { .. } => ErrorKind::AlreadyReleased,
            CustodyError::Http(_) | CustodyError::ExternalService(_) | CustodyError::Broadcast(_) => {
                ErrorKind::ExternalService
            }
            CustodyError::KeyDerivation(_) => ErrorKind::KeyDerivation,
            _ => ErrorKind::Internal,
        }
    }

    /// Only failures of external collaborators are worth retrying on a later tick.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ExternalService
    }
}
