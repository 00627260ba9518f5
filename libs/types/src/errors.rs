//! Error types for the feed client
//!
//! Two taxonomies live here: `FeedError`, the small set of conditions a
//! caller can observe, and `VenueErrorCode`, the classification of the
//! `error.code` string the venue attaches to a failed reply.

use thiserror::Error;

/// Caller-visible failure of a client operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("operation requires an authorized session")]
    NoAuthorization,

    #[error("operation requires an open connection")]
    NoOpenConnection,

    #[error("stream has not been initialized")]
    NoInit,

    #[error("request did not complete successfully")]
    UnknownError,

    #[error("unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FeedError {
    /// Stable string code for logs and external consumers.
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::NoAuthorization => "NO_AUTHORIZATION",
            FeedError::NoOpenConnection => "NO_OPEN_CONNECTION",
            FeedError::NoInit => "NO_INIT",
            FeedError::UnknownError => "UNKNOWN_ERROR",
            FeedError::UnknownSymbol { .. } => "UNKNOWN_SYMBOL",
            FeedError::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Precondition failures are decided locally and never touch the network.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FeedError::NoAuthorization | FeedError::NoOpenConnection | FeedError::NoInit
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

/// Classified `error.code` from a venue reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueErrorCode {
    /// Provider throttling; replay after a delay
    RateLimit,
    /// Subscription already active; nothing to do
    AlreadySubscribed,
    /// Credential rejected; never retried
    InvalidToken,
    /// Anything else, kept verbatim for logging
    Other(String),
}

impl VenueErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "RateLimit" => VenueErrorCode::RateLimit,
            "AlreadySubscribed" => VenueErrorCode::AlreadySubscribed,
            "InvalidToken" => VenueErrorCode::InvalidToken,
            other => VenueErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VenueErrorCode::RateLimit => "RateLimit",
            VenueErrorCode::AlreadySubscribed => "AlreadySubscribed",
            VenueErrorCode::InvalidToken => "InvalidToken",
            VenueErrorCode::Other(code) => code,
        }
    }

    /// How a reply carrying this code is recovered.
    ///
    /// `subscription` is true for tick and proposal replies, `credential` for
    /// authorize replies; outside those kinds the special codes fall back to
    /// a plain replay.
    pub fn retry_policy(&self, subscription: bool, credential: bool) -> RetryPolicy {
        match self {
            VenueErrorCode::RateLimit => RetryPolicy::ReplayAfterBackoff,
            VenueErrorCode::AlreadySubscribed if subscription => RetryPolicy::Suppress,
            VenueErrorCode::InvalidToken if credential => RetryPolicy::GiveUp,
            _ => RetryPolicy::Replay,
        }
    }
}

/// Recovery action for a failed reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Delay the next transmission, then replay the request once
    ReplayAfterBackoff,
    /// Replay the request once
    Replay,
    /// Treat as success; nothing is sent
    Suppress,
    /// Terminal; never retried
    GiveUp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_codes() {
        assert_eq!(FeedError::NoAuthorization.code(), "NO_AUTHORIZATION");
        assert_eq!(FeedError::NoOpenConnection.code(), "NO_OPEN_CONNECTION");
        assert_eq!(FeedError::NoInit.code(), "NO_INIT");
        assert_eq!(FeedError::UnknownError.code(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_precondition_classification() {
        assert!(FeedError::NoInit.is_precondition());
        assert!(!FeedError::UnknownError.is_precondition());
    }

    #[test]
    fn test_unknown_symbol_display() {
        let err = FeedError::UnknownSymbol {
            symbol: "R_10".to_string(),
        };
        assert!(err.to_string().contains("R_10"));
    }

    #[test]
    fn test_venue_error_code_parsing() {
        assert_eq!(VenueErrorCode::from_code("RateLimit"), VenueErrorCode::RateLimit);
        assert_eq!(
            VenueErrorCode::from_code("AlreadySubscribed"),
            VenueErrorCode::AlreadySubscribed
        );
        assert_eq!(VenueErrorCode::from_code("InvalidToken"), VenueErrorCode::InvalidToken);
        let other = VenueErrorCode::from_code("MarketIsClosed");
        assert_eq!(other.as_str(), "MarketIsClosed");
    }

    #[test]
    fn test_retry_policy_by_reply_kind() {
        let already = VenueErrorCode::AlreadySubscribed;
        assert_eq!(already.retry_policy(true, false), RetryPolicy::Suppress);
        assert_eq!(already.retry_policy(false, false), RetryPolicy::Replay);

        let invalid = VenueErrorCode::InvalidToken;
        assert_eq!(invalid.retry_policy(false, true), RetryPolicy::GiveUp);
        assert_eq!(invalid.retry_policy(true, false), RetryPolicy::Replay);

        assert_eq!(
            VenueErrorCode::RateLimit.retry_policy(true, true),
            RetryPolicy::ReplayAfterBackoff
        );
        assert_eq!(
            VenueErrorCode::Other("InputValidationFailed".into()).retry_policy(false, false),
            RetryPolicy::Replay
        );
    }
}
