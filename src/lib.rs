//! debug-assist: one request shape for every AI backend that answers
//! debugging questions, with caching, retry and provider fallback.
//!
//! ```text
//! consumer ──CanonicalRequest──▶ ProviderManager
//!                                   ├─ ResponseCache (5 min TTL)
//!                                   ├─ RetryPolicy / FailoverSequence
//!                                   └─ dyn ProviderAdapter ──▶ Adapter<W: WireProtocol>
//!                                         ├─ CredentialAccessor
//!                                         ├─ ConversationHistory
//!                                         └─ anthropic | openai | gemini | ollama
//! ```
//!
//! Adapters never return `Err` for backend failures: they produce a
//! `CanonicalResponse` with `success == false` and a classified
//! [`error::ErrorKind`]. `Err` is reserved for configuration and
//! credential-store problems surfaced through the manager's API.

pub mod error;
pub mod config;
pub mod providers;
pub mod request;
pub mod failover;
pub mod client;
pub mod cache;
pub mod credentials;
pub mod history;
pub mod prompt;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use client::{ManagerStatus, ProviderManager};
pub use config::{AssistConfig, ManagerConfig, ProviderSettings};
pub use credentials::{CredentialAccessor, MemoryCredentials};
pub use error::{Error, ErrorClass, ErrorKind};
pub use providers::ProviderAdapter;
pub use request::
{   CanonicalRequest
  , CanonicalResponse
  , ConversationEntry
  , Role
  , StopReason
  , TokenUsage
  , Validation
};

/// The fixed set of supported AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId
{   /// Anthropic Messages API (Claude models)
    Anthropic
  , /// OpenAI Chat Completions API
    #[serde(rename = "openai")]
    OpenAi
  , /// Google Gemini (AI Studio) API
    Gemini
  , /// Local Ollama server; needs no credential
    Ollama
}

impl ProviderId
{   pub const ALL: [ProviderId; 4] = [
      ProviderId::Anthropic
    , ProviderId::OpenAi
    , ProviderId::Gemini
    , ProviderId::Ollama
    ];

    pub fn as_str(&self) -> &'static str
    {   match self
        {   ProviderId::Anthropic => "anthropic"
          , ProviderId::OpenAi => "openai"
          , ProviderId::Gemini => "gemini"
          , ProviderId::Ollama => "ollama"
        }
    }

    /// Human-facing name used in error messages.
    pub fn display_name(&self) -> &'static str
    {   match self
        {   ProviderId::Anthropic => "Anthropic Claude"
          , ProviderId::OpenAi => "OpenAI"
          , ProviderId::Gemini => "Google Gemini"
          , ProviderId::Ollama => "Ollama (local)"
        }
    }
}

impl fmt::Display for ProviderId
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId
{   type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {   match s.trim().to_ascii_lowercase().as_str()
        {   "anthropic" | "claude" => Ok(ProviderId::Anthropic)
          , "openai" => Ok(ProviderId::OpenAi)
          , "gemini" | "google" => Ok(ProviderId::Gemini)
          , "ollama" | "local" => Ok(ProviderId::Ollama)
          , other => Err(crate::error::Error::UnknownProvider(
              other.to_string()
            ))
        }
    }
}

/// Static metadata describing one adapter. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor
{   pub id: ProviderId
  , /// Model requested when the settings do not name one
    pub default_model: String
  , /// Whether a stored secret is needed before any call
    pub requires_credential: bool
  , /// Maximum context window (in tokens)
    pub max_context_window: u32
  , /// Completion budget used when the request sets none
    pub default_max_tokens: u32
  , pub supports_streaming: bool
  , /// Blended cost per 1M tokens (in USD), when the backend bills
    pub cost_per_million_tokens: Option<f64>
  , pub description: String
}

/// A descriptor merged with the adapter's live availability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capabilities
{   #[serde(flatten)]
    pub descriptor: ProviderDescriptor
  , pub available: bool
}
