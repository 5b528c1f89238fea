use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced by fallible API calls (configuration, credentials,
/// provider selection). Backend failures are not represented here: they
/// travel inside a `CanonicalResponse` as an [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum Error
{   /// Provider identifier could not be parsed
    #[error("Unknown provider: {0}")]
    UnknownProvider(String)
  , /// Provider is not part of this manager's configuration
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(crate::ProviderId)
  , /// Provider exists but is not currently usable
    #[error("Provider not available: {0}")]
    ProviderUnavailable(crate::ProviderId)
  , /// Secret rejected by the format check before storing
    #[error("Invalid credential format for {provider}: {reason}")]
    InvalidCredentialFormat
    {   provider: crate::ProviderId
      , reason: String
    }
  , /// The secret store failed to read or write
    #[error("Credential store error: {0}")]
    CredentialStore(String)
  , /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String)
  , #[error("I/O error: {0}")]
    Io(#[from] std::io::Error)
  , #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error)
}

/// Classified failure of one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind
{   /// No secret stored for a provider that requires one
    MissingCredential
  , /// Backend rejected the secret (401/403)
    InvalidCredential
  , /// 429 without a quota signal
    RateLimited
  , /// 5xx, overload, or the connection itself failed
    BackendUnavailable
  , /// Billing or usage quota exhausted
    QuotaExceeded
  , /// Payload decoded but no text could be located
    MalformedResponse
  , /// Backend refused a well-formed request (400/404/422)
    InvalidRequest
  , /// Raised by the manager's timeout wrapper
    Timeout
}

/// Retry semantics of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass
{   /// Credential missing or wrong: fall back, never retry
    Configuration
  , /// Worth retrying on the same provider
    Transient
  , /// Retrying the same request cannot help
    Permanent
}

impl ErrorKind
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   ErrorKind::MissingCredential => "missing_credential"
          , ErrorKind::InvalidCredential => "invalid_credential"
          , ErrorKind::RateLimited => "rate_limited"
          , ErrorKind::BackendUnavailable => "backend_unavailable"
          , ErrorKind::QuotaExceeded => "quota_exceeded"
          , ErrorKind::MalformedResponse => "malformed_response"
          , ErrorKind::InvalidRequest => "invalid_request"
          , ErrorKind::Timeout => "timeout"
        }
    }

    pub fn class(&self) -> ErrorClass
    {   match self
        {   ErrorKind::MissingCredential
          | ErrorKind::InvalidCredential => ErrorClass::Configuration
          , ErrorKind::RateLimited
          | ErrorKind::BackendUnavailable
          | ErrorKind::Timeout => ErrorClass::Transient
          , ErrorKind::QuotaExceeded
          | ErrorKind::MalformedResponse
          | ErrorKind::InvalidRequest => ErrorClass::Permanent
        }
    }

    /// Whether another attempt against the same provider may succeed.
    pub fn is_retryable(&self) -> bool
    {   self.class() == ErrorClass::Transient
    }

    /// Map an HTTP status to a kind. Bodies are consulted only to tell a
    /// quota exhaustion apart from a plain rate limit.
    pub fn from_status(status: u16, body: &str) -> ErrorKind
    {   match status
        {   401 | 403 => ErrorKind::InvalidCredential
          , 402 => ErrorKind::QuotaExceeded
          , 429 => {
              if mentions_quota(body)
              {   ErrorKind::QuotaExceeded
              } else
              {   ErrorKind::RateLimited
              }
            }
          , 408 => ErrorKind::Timeout
          , s if s >= 500 => ErrorKind::BackendUnavailable
          , _ => ErrorKind::InvalidRequest
        }
    }
}

fn mentions_quota(body: &str) -> bool
{   let lower = body.to_ascii_lowercase();
    lower.contains("insufficient_quota")
      || lower.contains("quota exceeded")
      || lower.contains("exceeded your current quota")
      || lower.contains("credit balance")
}

impl fmt::Display for ErrorKind
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}
