//! LLM provider implementations
//!
//! Every backend is an [`Adapter`] over a [`WireProtocol`]. The adapter
//! owns everything backends share (credentials, history, timing, token
//! accounting, streaming, cancellation); the protocol owns only the bytes on
//! the wire.

pub mod adapter;
pub mod stream;
pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::credentials::CredentialAccessor;
use crate::error::{Error, ErrorKind};
use crate::request::
{   CanonicalRequest
  , CanonicalResponse
  , ConversationEntry
  , StopReason
  , TokenUsage
  , Validation
};
use crate::{Capabilities, ProviderDescriptor, ProviderId};

pub use adapter::Adapter;
pub use anthropic::Anthropic;
pub use gemini::Gemini;
pub use ollama::Ollama;
pub use openai::OpenAi;

pub type AnthropicAdapter = Adapter<Anthropic>;
pub type OpenAiAdapter = Adapter<OpenAi>;
pub type GeminiAdapter = Adapter<Gemini>;
pub type OllamaAdapter = Adapter<Ollama>;

/// The contract every backend adapter fulfils.
///
/// `send_request` and `send_request_streaming` never fail: every expected
/// failure is a `CanonicalResponse` with `success == false`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync
{   fn id(&self) -> ProviderId;

    fn descriptor(&self) -> &ProviderDescriptor;

    /// Local readiness only: a stored credential, or for credential-less
    /// backends a reachable, non-exhausted host. No completion is issued.
    async fn is_available(&self) -> bool;

    async fn capabilities(&self) -> Capabilities
    {   Capabilities
        {   descriptor: self.descriptor().clone()
          , available: self.is_available().await
        }
    }

    /// Buffered call. Appends the exchange to this adapter's history on
    /// success.
    async fn send_request(&self, request: &CanonicalRequest) -> CanonicalResponse;

    /// Streamed call. `on_chunk` sees each fragment as it is decoded. When
    /// `cancel` fires, no further fragments are delivered and the partial
    /// text returns with `StopReason::Cancelled`.
    async fn send_request_streaming(
      &self
    , request: &CanonicalRequest
    , on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
    , cancel: &CancellationToken
    ) -> CanonicalResponse;

    /// Live round-trip with a minimal token budget.
    async fn validate(&self) -> Validation;

    async fn set_credentials(&self, secret: String) -> Result<(), Error>;

    async fn clear_credentials(&self) -> Result<(), Error>;

    fn clear_history(&self);
}

/// Degraded streaming for backends without a stream endpoint: one buffered
/// call, then a single chunk carrying the full text.
pub async fn stream_by_buffering<A>(
  adapter: &A
, request: &CanonicalRequest
, on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
) -> CanonicalResponse
where
  A: ProviderAdapter + ?Sized
{   let response = adapter.send_request(request).await;
    if response.success
    {   on_chunk(&response.text);
    }
    response
}

/// Everything a protocol needs to build one HTTP call.
#[derive(Debug)]
pub struct WireCall<'a>
{   pub base: &'a str
  , pub model: &'a str
  , /// Absent for credential-less backends
    pub secret: Option<&'a str>
  , pub system: &'a str
  , /// Prior turns followed by the new user prompt
    pub messages: &'a [ConversationEntry]
  , pub max_tokens: u32
  , pub temperature: Option<f32>
  , pub stream: bool
}

/// Text located in a buffered response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion
{   pub text: String
  , pub usage: Option<TokenUsage>
  , pub stop_reason: Option<StopReason>
}

/// What one decoded stream line contributes.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent
{   Text(String)
  , InputTokens(u32)
  , OutputTokens(u32)
  , Stop(StopReason)
  , /// The backend's end-of-stream sentinel
    Done
  , /// The backend reported an error inside the stream
    Failed(ErrorKind, String)
}

/// Backend-specific request building and response decoding.
pub trait WireProtocol: Send + Sync + 'static
{   fn descriptor(&self) -> ProviderDescriptor;

    fn default_base(&self) -> &'static str;

    fn request(&self, client: &Client, call: &WireCall<'_>) -> RequestBuilder;

    /// `Err` means the body decoded but held no usable text.
    fn parse_completion(&self, body: &str) -> Result<Completion, String>;

    /// Decode one complete line of the stream. Lines without a payload
    /// yield no events; `Err` marks the line malformed.
    fn parse_stream_line(&self, line: &str) -> Result<Vec<StreamEvent>, String>;

    fn classify_failure(&self, status: u16, body: &str) -> ErrorKind
    {   ErrorKind::from_status(status, body)
    }

    /// Reachability check for credential-less backends.
    fn probe(&self, _client: &Client, _base: &str) -> Option<RequestBuilder>
    {   None
    }
}

/// Strip an SSE `data:` marker. `None` for comments, `event:` lines and
/// anything else without a payload.
pub(crate) fn sse_data(line: &str) -> Option<&str>
{   let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

/// Construct the adapter for `settings.id`.
pub fn build_adapter(
  settings: &ProviderSettings
, credentials: Arc<dyn CredentialAccessor>
, client: Client
, history_limit: usize
) -> Arc<dyn ProviderAdapter>
{   match settings.id
    {   ProviderId::Anthropic => Arc::new(
          Adapter::new(Anthropic, settings, credentials, client, history_limit)
        )
      , ProviderId::OpenAi => Arc::new(
          Adapter::new(OpenAi, settings, credentials, client, history_limit)
        )
      , ProviderId::Gemini => Arc::new(
          Adapter::new(Gemini, settings, credentials, client, history_limit)
        )
      , ProviderId::Ollama => Arc::new(
          Adapter::new(Ollama, settings, credentials, client, history_limit)
        )
    }
}
