//! Anthropic Messages API
//!
//! Streaming uses typed SSE events: `message_start` carries input usage,
//! `content_block_delta` carries text, `message_delta` carries the stop
//! reason and output usage, and `message_stop` ends the stream.

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::{sse_data, Completion, StreamEvent, WireCall, WireProtocol};
use crate::error::ErrorKind;
use crate::request::{Role, StopReason, TokenUsage};
use crate::{ProviderDescriptor, ProviderId};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a>
{   model: &'a str
  , max_tokens: u32
  , system: &'a str
  , messages: Vec<Message<'a>>
  , #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>
  , #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool
}

#[derive(Debug, Serialize)]
struct Message<'a>
{   role: &'static str
  , content: &'a str
}

#[derive(Debug, Deserialize)]
struct MessagesResponse
{   #[serde(default)]
    content: Vec<ContentBlock>
  , usage: Option<Usage>
  , stop_reason: Option<String>
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock
{   #[serde(rename = "text")]
    Text { text: String }
  , #[serde(other)]
    Other
}

#[derive(Debug, Default, Deserialize)]
struct Usage
{   #[serde(default)]
    input_tokens: Option<u32>
  , #[serde(default)]
    output_tokens: Option<u32>
}

/// A raw SSE event from the streaming Messages API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event
{   MessageStart { message: StartMessage }
  , ContentBlockDelta { delta: BlockDelta }
  , MessageDelta
    {   delta: MessageDeltaBody
      , #[serde(default)]
        usage: Option<Usage>
    }
  , MessageStop
  , Error { error: ApiError }
  , #[serde(other)]
    Other
}

#[derive(Debug, Deserialize)]
struct StartMessage
{   #[serde(default)]
    usage: Option<Usage>
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BlockDelta
{   #[serde(rename = "text_delta")]
    Text { text: String }
  , #[serde(other)]
    Other
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody
{   stop_reason: Option<String>
}

#[derive(Debug, Deserialize)]
struct ApiError
{   #[serde(rename = "type")]
    kind: String
  , message: String
}

fn error_kind(api_type: &str) -> ErrorKind
{   match api_type
    {   "authentication_error" | "permission_error" => ErrorKind::InvalidCredential
      , "rate_limit_error" => ErrorKind::RateLimited
      , "overloaded_error" | "api_error" => ErrorKind::BackendUnavailable
      , "invalid_request_error" | "not_found_error" => ErrorKind::InvalidRequest
      , _ => ErrorKind::BackendUnavailable
    }
}

/// Anthropic Messages protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anthropic;

impl WireProtocol for Anthropic
{   fn descriptor(&self) -> ProviderDescriptor
    {   ProviderDescriptor
        {   id: ProviderId::Anthropic
          , default_model: "claude-3-5-sonnet-latest".to_string()
          , requires_credential: true
          , max_context_window: 200_000
          , default_max_tokens: 1024
          , supports_streaming: true
          , cost_per_million_tokens: Some(3.0)
          , description: "Anthropic Claude models via the Messages API".to_string()
        }
    }

    fn default_base(&self) -> &'static str
    {   ANTHROPIC_API_BASE
    }

    fn request(&self, client: &Client, call: &WireCall<'_>) -> RequestBuilder
    {   let body = MessagesRequest
        {   model: call.model
          , max_tokens: call.max_tokens
          , system: call.system
          , messages: call.messages
              .iter()
              .map(|m| Message
              {   role: match m.role
                  {   Role::User => "user"
                    , Role::Assistant => "assistant"
                  }
                , content: &m.content
              })
              .collect()
          , temperature: call.temperature
          , stream: call.stream
        };

        client
          .post(format!("{}/v1/messages", call.base))
          .header("x-api-key", call.secret.unwrap_or_default())
          .header("anthropic-version", ANTHROPIC_VERSION)
          .json(&body)
    }

    fn parse_completion(&self, body: &str) -> Result<Completion, String>
    {   let response: MessagesResponse = serde_json::from_str(body)
          .map_err(|e| format!("invalid Anthropic response: {}", e))?;
        let text: Vec<String> = response.content
          .into_iter()
          .filter_map(|block| match block
          {   ContentBlock::Text { text } => Some(text)
            , ContentBlock::Other => None
          })
          .collect();
        if text.is_empty()
        {   return Err("response has no text content block".to_string());
        }
        let usage = response.usage.and_then(|u| match (u.input_tokens, u.output_tokens)
        {   (Some(input), Some(output)) => Some(TokenUsage::new(input, output))
          , _ => None
        });
        Ok(Completion
        {   text: text.join("\n")
          , usage
          , stop_reason: response.stop_reason.as_deref().map(StopReason::from_backend)
        })
    }

    fn parse_stream_line(&self, line: &str) -> Result<Vec<StreamEvent>, String>
    {   let Some(data) = sse_data(line) else { return Ok(vec![]) };
        let event: Event = serde_json::from_str(data)
          .map_err(|e| format!("invalid Anthropic event: {}", e))?;
        let events = match event
        {   Event::MessageStart { message } => message.usage
              .and_then(|u| u.input_tokens)
              .map(StreamEvent::InputTokens)
              .into_iter()
              .collect()
          , Event::ContentBlockDelta { delta: BlockDelta::Text { text } } => {
              vec![StreamEvent::Text(text)]
            }
          , Event::ContentBlockDelta { delta: BlockDelta::Other } => vec![]
          , Event::MessageDelta { delta, usage } => {
              let mut events = Vec::new();
              if let Some(reason) = delta.stop_reason
              {   events.push(StreamEvent::Stop(StopReason::from_backend(&reason)));
              }
              if let Some(output) = usage.and_then(|u| u.output_tokens)
              {   events.push(StreamEvent::OutputTokens(output));
              }
              events
            }
          , Event::MessageStop => vec![StreamEvent::Done]
          , Event::Error { error } => {
              vec![StreamEvent::Failed(error_kind(&error.kind), error.message)]
            }
          , Event::Other => vec![]
        };
        Ok(events)
    }

    fn classify_failure(&self, status: u16, body: &str) -> ErrorKind
    {   if body.contains("credit balance")
        {   return ErrorKind::QuotaExceeded;
        }
        ErrorKind::from_status(status, body)
    }
}
