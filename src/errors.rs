//! Error types for the survival lottery core
//!
//! Every failure is classified so callers can decide whether to show it to the
//! user, retry it, or abort startup.

use std::error::Error as StdError;
use std::fmt;

/// Root error type for all lottery operations
#[derive(Debug)]
pub enum LotteryError {
    /// Bad input from a user or admin command
    Validation(ValidationError),

    /// Operation not valid in the entity's current lifecycle state
    StateConflict(StateConflictError),

    /// Ledger RPC, messaging sink, or another collaborator failed
    ExternalService(ExternalServiceError),

    /// Snapshot or record could not be read or written
    Persistence(StorageError),

    /// Startup configuration is unusable
    Configuration(ConfigurationError),
}

/// Input validation failures (user-visible, no state change)
#[derive(Debug)]
pub enum ValidationError {
    GameNotFound { chat_id: i64 },
    AlreadyJoined { user_id: i64 },
    GameFull { max_players: u32 },
    UserBlocked { user_id: i64 },
    NotEnoughPlayers { have: usize, need: u32 },
    InvalidGameConfig(String),
    InvalidAmount(u64),
    InvalidRange { min: u64, max: u64 },
    PaymentRequired,
    PaymentNotFound(String),
    PaymentNotAccepted { payment_id: String, reason: String },
    WalletNotLinked { user_id: i64 },
}

/// Lifecycle conflicts (user-visible, no state change)
#[derive(Debug)]
pub enum StateConflictError {
    GameInProgress { chat_id: i64, state: String },
    InvalidGameTransition { operation: &'static str, state: String },
    InvalidPaymentTransition { payment_id: String, operation: &'static str, status: String },
    AlreadyRefunded { payment_id: String },
}

/// Failures reported by external collaborators
#[derive(Debug)]
pub enum ExternalServiceError {
    Ledger(String),
    Messaging(String),
    WalletResolver(String),
    Encoder(String),
    Randomness(String),
    ConfirmationTimeout { signature: String, timeout_ms: u64 },
    TransactionFailed { signature: String, reason: String },
}

/// Storage system errors
#[derive(Debug)]
pub enum StorageError {
    DatabaseOpenFailed(String),
    ReadFailed(String),
    WriteFailed(String),
    CorruptedData(String),
    PermissionDenied(String),
}

/// Configuration and validation errors
#[derive(Debug)]
pub enum ConfigurationError {
    ValidationFailed(String),
    MissingRequired(String),
    InvalidValue { field: String, value: String, reason: String },
    LoadFailed(String),
}

impl LotteryError {
    /// Whether the message can be shown to the chat user as-is
    pub fn is_user_visible(&self) -> bool {
        matches!(self, LotteryError::Validation(_) | LotteryError::StateConflict(_))
    }

    /// Only configuration problems are allowed to stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, LotteryError::Configuration(_))
    }
}

impl fmt::Display for LotteryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LotteryError::Validation(e) => write!(f, "Validation error: {}", e),
            LotteryError::StateConflict(e) => write!(f, "State conflict: {}", e),
            LotteryError::ExternalService(e) => write!(f, "External service error: {}", e),
            LotteryError::Persistence(e) => write!(f, "Persistence error: {}", e),
            LotteryError::Configuration(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::GameNotFound { chat_id } => write!(f, "No game in chat {}", chat_id),
            ValidationError::AlreadyJoined { user_id } => write!(f, "User {} already joined", user_id),
            ValidationError::GameFull { max_players } => {
                write!(f, "Game is full ({} players)", max_players)
            }
            ValidationError::UserBlocked { user_id } => write!(f, "User {} is blocked", user_id),
            ValidationError::NotEnoughPlayers { have, need } => {
                write!(f, "Not enough players: {} joined, {} required", have, need)
            }
            ValidationError::InvalidGameConfig(msg) => write!(f, "Invalid game config: {}", msg),
            ValidationError::InvalidAmount(amount) => write!(f, "Invalid amount: {}", amount),
            ValidationError::InvalidRange { min, max } => {
                write!(f, "Invalid range: [{}, {}]", min, max)
            }
            ValidationError::PaymentRequired => write!(f, "Entry fee payment required"),
            ValidationError::PaymentNotFound(id) => write!(f, "Payment not found: {}", id),
            ValidationError::PaymentNotAccepted { payment_id, reason } => {
                write!(f, "Payment {} not accepted: {}", payment_id, reason)
            }
            ValidationError::WalletNotLinked { user_id } => {
                write!(f, "User {} has no verified wallet", user_id)
            }
        }
    }
}

impl fmt::Display for StateConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateConflictError::GameInProgress { chat_id, state } => {
                write!(f, "Chat {} already has a game in state {}", chat_id, state)
            }
            StateConflictError::InvalidGameTransition { operation, state } => {
                write!(f, "Cannot {} a game in state {}", operation, state)
            }
            StateConflictError::InvalidPaymentTransition { payment_id, operation, status } => {
                write!(f, "Cannot {} payment {} in status {}", operation, payment_id, status)
            }
            StateConflictError::AlreadyRefunded { payment_id } => {
                write!(f, "Payment {} was already refunded", payment_id)
            }
        }
    }
}

impl fmt::Display for ExternalServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalServiceError::Ledger(msg) => write!(f, "Ledger failure: {}", msg),
            ExternalServiceError::Messaging(msg) => write!(f, "Messaging failure: {}", msg),
            ExternalServiceError::WalletResolver(msg) => write!(f, "Wallet lookup failed: {}", msg),
            ExternalServiceError::Encoder(msg) => write!(f, "Payment encoder failed: {}", msg),
            ExternalServiceError::Randomness(msg) => write!(f, "Randomness failure: {}", msg),
            ExternalServiceError::ConfirmationTimeout { signature, timeout_ms } => {
                write!(f, "Transaction {} not confirmed within {}ms", signature, timeout_ms)
            }
            ExternalServiceError::TransactionFailed { signature, reason } => {
                write!(f, "Transaction {} failed: {}", signature, reason)
            }
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::DatabaseOpenFailed(msg) => write!(f, "Database open failed: {}", msg),
            StorageError::ReadFailed(msg) => write!(f, "Read failed: {}", msg),
            StorageError::WriteFailed(msg) => write!(f, "Write failed: {}", msg),
            StorageError::CorruptedData(msg) => write!(f, "Corrupted data: {}", msg),
            StorageError::PermissionDenied(path) => write!(f, "Permission denied: {}", path),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::ValidationFailed(msg) => write!(f, "Validation failed: {}", msg),
            ConfigurationError::MissingRequired(field) => write!(f, "Missing required field: {}", field),
            ConfigurationError::InvalidValue { field, value, reason } => {
                write!(f, "Invalid value for {}: '{}' ({})", field, value, reason)
            }
            ConfigurationError::LoadFailed(msg) => write!(f, "Failed to load configuration: {}", msg),
        }
    }
}

impl StdError for LotteryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            LotteryError::Validation(e) => Some(e),
            LotteryError::StateConflict(e) => Some(e),
            LotteryError::ExternalService(e) => Some(e),
            LotteryError::Persistence(e) => Some(e),
            LotteryError::Configuration(e) => Some(e),
        }
    }
}

impl StdError for ValidationError {}
impl StdError for StateConflictError {}
impl StdError for ExternalServiceError {}
impl StdError for StorageError {}
impl StdError for ConfigurationError {}

impl From<ValidationError> for LotteryError {
    fn from(e: ValidationError) -> Self {
        LotteryError::Validation(e)
    }
}

impl From<StateConflictError> for LotteryError {
    fn from(e: StateConflictError) -> Self {
        LotteryError::StateConflict(e)
    }
}

impl From<ExternalServiceError> for LotteryError {
    fn from(e: ExternalServiceError) -> Self {
        LotteryError::ExternalService(e)
    }
}

impl From<StorageError> for LotteryError {
    fn from(e: StorageError) -> Self {
        LotteryError::Persistence(e)
    }
}

impl From<ConfigurationError> for LotteryError {
    fn from(e: ConfigurationError) -> Self {
        LotteryError::Configuration(e)
    }
}

impl From<rocksdb::Error> for LotteryError {
    fn from(e: rocksdb::Error) -> Self {
        LotteryError::Persistence(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<std::io::Error> for LotteryError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                LotteryError::Persistence(StorageError::PermissionDenied(e.to_string()))
            }
            _ => LotteryError::Persistence(StorageError::ReadFailed(e.to_string())),
        }
    }
}

impl From<serde_json::Error> for LotteryError {
    fn from(e: serde_json::Error) -> Self {
        LotteryError::Persistence(StorageError::CorruptedData(e.to_string()))
    }
}

/// Convenience type alias for Results
pub type LotteryResult<T> = Result<T, LotteryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: LotteryError = ValidationError::GameFull { max_players: 50 }.into();

        assert!(err.to_string().contains("Validation error"));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_user_visibility() {
        let validation: LotteryError = ValidationError::AlreadyJoined { user_id: 7 }.into();
        let conflict: LotteryError = StateConflictError::InvalidGameTransition {
            operation: "join",
            state: "DRAWING".to_string(),
        }
        .into();
        let ledger: LotteryError = ExternalServiceError::Ledger("rpc down".to_string()).into();

        assert!(validation.is_user_visible());
        assert!(conflict.is_user_visible());
        assert!(!ledger.is_user_visible());
        assert!(!ledger.is_fatal());
    }

    #[test]
    fn test_configuration_is_fatal() {
        let err: LotteryError = ConfigurationError::MissingRequired("randomness.secret_key".to_string()).into();
        assert!(err.is_fatal());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_refund_conflict_is_distinct() {
        let refunded = StateConflictError::AlreadyRefunded { payment_id: "p1".to_string() };
        let not_completed = StateConflictError::InvalidPaymentTransition {
            payment_id: "p1".to_string(),
            operation: "refund",
            status: "CONFIRMING".to_string(),
        };

        assert_ne!(refunded.to_string(), not_completed.to_string());
        assert!(refunded.to_string().contains("already refunded"));
    }
}
