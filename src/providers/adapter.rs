//! Backend-independent half of every provider adapter

use async_trait::async_trait;
use log::{debug, error, trace, warn};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::stream::{self, StreamOutcome};
use super::{Completion, ProviderAdapter, WireCall, WireProtocol};
use crate::config::ProviderSettings;
use crate::credentials::CredentialAccessor;
use crate::error::{Error, ErrorKind};
use crate::history::ConversationHistory;
use crate::prompt::{build_prompt, estimate_tokens, SYSTEM_PROMPT};
use crate::request::
{   CanonicalRequest
  , CanonicalResponse
  , ConversationEntry
  , StopReason
  , TokenUsage
  , Validation
};
use crate::{ProviderDescriptor, ProviderId};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const VALIDATION_PROMPT: &str = "Reply with the single word OK.";
const VALIDATION_MAX_TOKENS: u32 = 8;
const ERROR_BODY_EXCERPT: usize = 300;

/// A classified failure before it becomes a response.
struct Failure
{   kind: ErrorKind
  , message: String
}

impl Failure
{   fn new(kind: ErrorKind, message: impl Into<String>) -> Self
    {   Failure
        {   kind
          , message: message.into()
        }
    }
}

/// Provider adapter over one wire protocol.
pub struct Adapter<W: WireProtocol>
{   wire: W
  , descriptor: ProviderDescriptor
  , model: String
  , api_base: String
  , max_tokens: u32
  , client: Client
  , credentials: Arc<dyn CredentialAccessor>
  , history: ConversationHistory
  , /// Set by a quota failure on credential-less backends
    exhausted: AtomicBool
}

impl<W: WireProtocol> Adapter<W>
{   pub fn new(
      wire: W
    , settings: &ProviderSettings
    , credentials: Arc<dyn CredentialAccessor>
    , client: Client
    , history_limit: usize
    ) -> Self
    {   let descriptor = wire.descriptor();
        let model = settings
          .model
          .clone()
          .unwrap_or_else(|| descriptor.default_model.clone());
        let api_base = settings
          .api_base
          .clone()
          .unwrap_or_else(|| wire.default_base().to_string())
          .trim_end_matches('/')
          .to_string();
        let max_tokens = settings
          .max_tokens
          .unwrap_or(descriptor.default_max_tokens);
        debug!(
          "Creating {} adapter (model {}, base {})",
          descriptor.id, model, api_base
        );
        Adapter
        {   wire
          , descriptor
          , model
          , api_base
          , max_tokens
          , client
          , credentials
          , history: ConversationHistory::new(history_limit)
          , exhausted: AtomicBool::new(false)
        }
    }

    /// Stored history for a conversation key.
    pub fn history(&self, key: &str) -> Vec<ConversationEntry>
    {   self.history.get(key)
    }

    /// Transient copy of the secret for this call. `Ok(None)` for
    /// credential-less backends.
    async fn load_secret(&self) -> Result<Option<String>, Failure>
    {   if !self.descriptor.requires_credential
        {   return Ok(None);
        }
        match self.credentials.get(self.descriptor.id).await
        {   Ok(Some(secret)) if !secret.trim().is_empty() => Ok(Some(secret))
          , Ok(_) => Err(Failure::new(
              ErrorKind::MissingCredential
            , format!(
                "No API key configured for {}",
                self.descriptor.id.display_name()
              )
            ))
          , Err(e) => {
              warn!("Credential lookup failed for {}: {}", self.descriptor.id, e);
              Err(Failure::new(ErrorKind::MissingCredential, e.to_string()))
            }
        }
    }

    /// Prior turns (caller-supplied history wins over stored history)
    /// followed by the new prompt.
    fn messages_for(&self, request: &CanonicalRequest, prompt: &str) -> Vec<ConversationEntry>
    {   let mut messages = match &request.conversation_history
        {   Some(history) => history.clone()
          , None => self.history.get(request.conversation_key())
        };
        messages.push(ConversationEntry::user(prompt));
        messages
    }

    fn call<'a>(
      &'a self
    , secret: Option<&'a str>
    , messages: &'a [ConversationEntry]
    , max_tokens: u32
    , temperature: Option<f32>
    , stream: bool
    ) -> WireCall<'a>
    {   WireCall
        {   base: &self.api_base
          , model: &self.model
          , secret
          , system: SYSTEM_PROMPT
          , messages
          , max_tokens
          , temperature
          , stream
        }
    }

    /// Send and check the status; a non-2xx response becomes a classified
    /// failure.
    async fn dispatch(&self, call: &WireCall<'_>) -> Result<reqwest::Response, Failure>
    {   let name = self.descriptor.id.display_name();
        debug!(
          "Dispatching {} request (model {}, stream {})",
          name, call.model, call.stream
        );
        let response = self.wire
          .request(&self.client, call)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error from {}: {}", name, e);
            Failure::new(
              ErrorKind::BackendUnavailable
            , format!("could not reach {}: {}", name, e)
            )
          })?;

        let status = response.status();
        trace!("{} response status: {}", name, status);
        if status.is_success()
        {   return Ok(response);
        }

        let body = response.text().await
          .unwrap_or_else(|_| "Unknown error".to_string());
        let kind = self.wire.classify_failure(status.as_u16(), &body);
        self.note_failure(kind);
        warn!("{} API error ({}): {}", name, status, kind);
        Err(Failure::new(
          kind
        , format!(
            "{} returned HTTP {}: {}",
            name,
            status.as_u16(),
            excerpt(&body)
          )
        ))
    }

    async fn complete(&self, call: &WireCall<'_>) -> Result<Completion, Failure>
    {   let response = self.dispatch(call).await?;
        let body = response.text().await.map_err(|e| {
          Failure::new(
            ErrorKind::BackendUnavailable
          , format!("failed to read response body: {}", e)
          )
        })?;
        trace!("{} response: {}", self.descriptor.id, body);
        let completion = self.wire.parse_completion(&body).map_err(|e| {
          error!("Parse error from {}: {}", self.descriptor.id, e);
          Failure::new(ErrorKind::MalformedResponse, e)
        })?;
        if completion.text.trim().is_empty()
        {   return Err(Failure::new(
              ErrorKind::MalformedResponse
            , "response contained no text"
            ));
        }
        Ok(completion)
    }

    /// Reported counts where present, `ceil(chars / 4)` estimates otherwise.
    fn usage(
      &self
    , messages: &[ConversationEntry]
    , text: &str
    , input: Option<u32>
    , output: Option<u32>
    ) -> TokenUsage
    {   let input = input.unwrap_or_else(|| {
          estimate_tokens(SYSTEM_PROMPT)
            + messages.iter().map(|m| estimate_tokens(&m.content)).sum::<u32>()
        });
        let output = output.unwrap_or_else(|| estimate_tokens(text));
        TokenUsage::new(input, output)
    }

    /// A quota failure exhausts the backend until credentials change.
    fn note_failure(&self, kind: ErrorKind)
    {   if kind == ErrorKind::QuotaExceeded
        {   self.exhausted.store(true, Ordering::SeqCst);
        }
    }

    /// Partial text from a cancelled stream. Not recorded in history.
    fn cancelled(
      &self
    , messages: &[ConversationEntry]
    , text: String
    , input: Option<u32>
    , output: Option<u32>
    , started: Instant
    ) -> CanonicalResponse
    {   let usage = self.usage(messages, &text, input, output);
        CanonicalResponse::success(
          self.descriptor.id
        , text
        , usage
        , Some(StopReason::Cancelled)
        , elapsed_ms(started)
        )
    }

    fn fail(&self, failure: Failure, started: Instant) -> CanonicalResponse
    {   CanonicalResponse::failure(
          self.descriptor.id
        , failure.kind
        , failure.message
        , elapsed_ms(started)
        )
    }
}

#[async_trait]
impl<W: WireProtocol> ProviderAdapter for Adapter<W>
{   fn id(&self) -> ProviderId
    {   self.descriptor.id
    }

    fn descriptor(&self) -> &ProviderDescriptor
    {   &self.descriptor
    }

    async fn is_available(&self) -> bool
    {   if self.descriptor.requires_credential
        {   return matches!(self.load_secret().await, Ok(Some(_)));
        }
        if self.exhausted.load(Ordering::SeqCst)
        {   debug!("{} marked exhausted", self.descriptor.id);
            return false;
        }
        match self.wire.probe(&self.client, &self.api_base)
        {   None => true
          , Some(probe) => match probe.timeout(PROBE_TIMEOUT).send().await
            {   Ok(response) => response.status().is_success()
              , Err(e) => {
                  debug!("{} host unreachable: {}", self.descriptor.id, e);
                  false
                }
            }
        }
    }

    async fn send_request(&self, request: &CanonicalRequest) -> CanonicalResponse
    {   let started = Instant::now();
        let secret = match self.load_secret().await
        {   Ok(secret) => secret
          , Err(failure) => return self.fail(failure, started)
        };

        let prompt = build_prompt(request);
        let messages = self.messages_for(request, &prompt);
        let call = self.call(
          secret.as_deref()
        , &messages
        , request.max_tokens.unwrap_or(self.max_tokens)
        , request.temperature
        , false
        );

        let completion = match self.complete(&call).await
        {   Ok(completion) => completion
          , Err(failure) => return self.fail(failure, started)
        };

        let usage = match completion.usage
        {   Some(usage) => usage
          , None => self.usage(&messages, &completion.text, None, None)
        };
        self.history.append(request.conversation_key(), prompt, completion.text.clone());
        debug!(
          "{} answered in {} ms ({} tokens)",
          self.descriptor.id, elapsed_ms(started), usage.total
        );
        CanonicalResponse::success(
          self.descriptor.id
        , completion.text
        , usage
        , completion.stop_reason
        , elapsed_ms(started)
        )
    }

    async fn send_request_streaming(
      &self
    , request: &CanonicalRequest
    , on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
    , cancel: &CancellationToken
    ) -> CanonicalResponse
    {   if !self.descriptor.supports_streaming
        {   return super::stream_by_buffering(self, request, on_chunk).await;
        }

        let started = Instant::now();
        let secret = match self.load_secret().await
        {   Ok(secret) => secret
          , Err(failure) => return self.fail(failure, started)
        };

        let prompt = build_prompt(request);
        let messages = self.messages_for(request, &prompt);
        let call = self.call(
          secret.as_deref()
        , &messages
        , request.max_tokens.unwrap_or(self.max_tokens)
        , request.temperature
        , true
        );

        let dispatched = tokio::select!
        {   biased;
            _ = cancel.cancelled() => None
          , result = self.dispatch(&call) => Some(result)
        };
        let response = match dispatched
        {   Some(Ok(response)) => response
          , Some(Err(failure)) => return self.fail(failure, started)
          , None => {
              debug!("{} stream cancelled before the response arrived", self.descriptor.id);
              return self.cancelled(&messages, String::new(), None, None, started);
            }
        };

        let wire = &self.wire;
        let outcome: StreamOutcome = match stream::drive(
          response.bytes_stream()
        , |line| wire.parse_stream_line(line)
        , on_chunk
        , cancel
        ).await
        {   Ok(outcome) => outcome
          , Err(failure) => {
              warn!("{} stream failed: {}", self.descriptor.id, failure.message);
              self.note_failure(failure.kind);
              return self.fail(Failure::new(failure.kind, failure.message), started);
            }
        };

        if outcome.cancelled
        {   debug!("{} stream cancelled by caller", self.descriptor.id);
            return self.cancelled(
              &messages
            , outcome.text
            , outcome.input_tokens
            , outcome.output_tokens
            , started
            );
        }

        let usage = self.usage(
          &messages
        , &outcome.text
        , outcome.input_tokens
        , outcome.output_tokens
        );

        if outcome.text.trim().is_empty()
        {   return self.fail(
              Failure::new(ErrorKind::MalformedResponse, "stream contained no text")
            , started
            );
        }

        self.history.append(request.conversation_key(), prompt, outcome.text.clone());
        CanonicalResponse::success(
          self.descriptor.id
        , outcome.text
        , usage
        , outcome.stop_reason
        , elapsed_ms(started)
        )
    }

    async fn validate(&self) -> Validation
    {   let secret = match self.load_secret().await
        {   Ok(secret) => secret
          , Err(failure) => {
              return Validation::failed(format!("{}: {}", failure.kind, failure.message));
            }
        };
        let messages = [ConversationEntry::user(VALIDATION_PROMPT)];
        let call = self.call(
          secret.as_deref()
        , &messages
        , VALIDATION_MAX_TOKENS
        , Some(0.0)
        , false
        );
        match self.complete(&call).await
        {   Ok(_) => Validation::ok()
          , Err(failure) => Validation::failed(format!("{}: {}", failure.kind, failure.message))
        }
    }

    async fn set_credentials(&self, secret: String) -> Result<(), Error>
    {   let id = self.descriptor.id;
        self.exhausted.store(false, Ordering::SeqCst);
        if !self.descriptor.requires_credential
        {   debug!("{} takes no credential; ignoring", id);
            return Ok(());
        }
        let check = self.credentials.validate_format(id, &secret);
        if !check.valid
        {   return Err(Error::InvalidCredentialFormat
            {   provider: id
              , reason: check.error.unwrap_or_else(|| "invalid format".to_string())
            });
        }
        self.credentials.set(id, secret.trim().to_string()).await
    }

    async fn clear_credentials(&self) -> Result<(), Error>
    {   self.exhausted.store(false, Ordering::SeqCst);
        if !self.descriptor.requires_credential
        {   return Ok(());
        }
        self.credentials.delete(self.descriptor.id).await
    }

    fn clear_history(&self)
    {   self.history.clear();
    }
}

fn elapsed_ms(started: Instant) -> u64
{   started.elapsed().as_millis() as u64
}

fn excerpt(body: &str) -> &str
{   let body = body.trim();
    match body.char_indices().nth(ERROR_BODY_EXCERPT)
    {   Some((idx, _)) => &body[..idx]
      , None => body
    }
}
