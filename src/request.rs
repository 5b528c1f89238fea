//! Canonical request and response types shared by every adapter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::ProviderId;

/// Who authored a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   User
  , Assistant
}

/// One message in a per-conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry
{   pub role: Role
  , pub content: String
  , pub timestamp: DateTime<Utc>
}

impl ConversationEntry
{   pub fn user(content: impl Into<String>) -> Self
    {   ConversationEntry
        {   role: Role::User
          , content: content.into()
          , timestamp: Utc::now()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   ConversationEntry
        {   role: Role::Assistant
          , content: content.into()
          , timestamp: Utc::now()
        }
    }
}

/// A debugging question, backend agnostic. Built once per user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRequest
{   pub question: String
  , pub code_context: String
  , pub error_message: String
  , /// Also the conversation key
    pub file_path: String
  , pub error_type: String
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ConversationEntry>>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>
}

impl CanonicalRequest
{   pub fn new(
      question: impl Into<String>
    , code_context: impl Into<String>
    , error_message: impl Into<String>
    , file_path: impl Into<String>
    , error_type: impl Into<String>
    ) -> Self
    {   CanonicalRequest
        {   question: question.into()
          , code_context: code_context.into()
          , error_message: error_message.into()
          , file_path: file_path.into()
          , error_type: error_type.into()
          , conversation_history: None
          , max_tokens: None
          , temperature: None
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationEntry>) -> Self
    {   self.conversation_history = Some(history);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self
    {   self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self
    {   self.temperature = Some(temperature);
        self
    }

    /// Key under which multi-turn history is kept for this request.
    pub fn conversation_key(&self) -> &str
    {   &self.file_path
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage
{   pub input: u32
  , pub output: u32
  , pub total: u32
}

impl TokenUsage
{   pub fn new(input: u32, output: u32) -> Self
    {   TokenUsage
        {   input
          , output
          , total: input + output
        }
    }
}

/// Why a completion ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason
{   EndTurn
  , MaxTokens
  , StopSequence
  , /// Streaming was cancelled by the caller; text is partial
    Cancelled
  , Other(String)
}

impl StopReason
{   /// Normalize the finish reasons the four backends report.
    pub fn from_backend(raw: &str) -> StopReason
    {   match raw
        {   "end_turn" | "stop" | "STOP" => StopReason::EndTurn
          , "max_tokens" | "length" | "MAX_TOKENS" => StopReason::MaxTokens
          , "stop_sequence" => StopReason::StopSequence
          , other => StopReason::Other(other.to_string())
        }
    }
}

/// Normalized answer from one adapter call.
///
/// Built only through [`CanonicalResponse::success`] and
/// [`CanonicalResponse::failure`], which keep `success`, `text` and `error`
/// consistent: a failure always has empty text and an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalResponse
{   pub id: Uuid
  , pub text: String
  , pub provider_id: ProviderId
  , pub response_time_ms: u64
  , pub timestamp: DateTime<Utc>
  , pub token_usage: TokenUsage
  , pub success: bool
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>
}

impl CanonicalResponse
{   pub fn success(
      provider_id: ProviderId
    , text: String
    , token_usage: TokenUsage
    , stop_reason: Option<StopReason>
    , response_time_ms: u64
    ) -> Self
    {   CanonicalResponse
        {   id: Uuid::new_v4()
          , text
          , provider_id
          , response_time_ms
          , timestamp: Utc::now()
          , token_usage
          , success: true
          , error: None
          , error_kind: None
          , stop_reason
        }
    }

    /// A failed call. `error` renders as `"<kind>: <message>"`.
    pub fn failure(
      provider_id: ProviderId
    , kind: ErrorKind
    , message: impl AsRef<str>
    , response_time_ms: u64
    ) -> Self
    {   CanonicalResponse
        {   id: Uuid::new_v4()
          , text: String::new()
          , provider_id
          , response_time_ms
          , timestamp: Utc::now()
          , token_usage: TokenUsage::default()
          , success: false
          , error: Some(format!("{}: {}", kind, message.as_ref()))
          , error_kind: Some(kind)
          , stop_reason: None
        }
    }

    /// Prefix the error with diagnostic context, keeping the kind.
    pub fn with_error_context(mut self, context: &str) -> Self
    {   if let Some(error) = self.error.take()
        {   self.error = Some(format!("{}: {}", context, error));
        }
        self
    }
}

/// Result of a live credential round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation
{   pub valid: bool
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>
}

impl Validation
{   pub fn ok() -> Self
    {   Validation
        {   valid: true
          , error: None
        }
    }

    pub fn failed(error: impl Into<String>) -> Self
    {   Validation
        {   valid: false
          , error: Some(error.into())
        }
    }
}
