//! Local Ollama server (`/api/chat`)
//!
//! Needs no credential. The stream is newline-delimited JSON without a
//! marker prefix; the object with `"done": true` is the sentinel.

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::{Completion, StreamEvent, WireCall, WireProtocol};
use crate::error::ErrorKind;
use crate::request::{Role, StopReason, TokenUsage};
use crate::{ProviderDescriptor, ProviderId};

const OLLAMA_API_BASE: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatRequest<'a>
{   model: &'a str
  , messages: Vec<Message<'a>>
  , stream: bool
  , options: Options
}

#[derive(Debug, Serialize)]
struct Message<'a>
{   role: &'static str
  , content: &'a str
}

#[derive(Debug, Serialize)]
struct Options
{   num_predict: u32
  , #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>
}

/// Both the buffered response and each stream line.
#[derive(Debug, Deserialize)]
struct ChatResponse
{   #[serde(default)]
    message: Option<ResponseMessage>
  , #[serde(default)]
    done: bool
  , #[serde(default)]
    done_reason: Option<String>
  , #[serde(default)]
    prompt_eval_count: Option<u32>
  , #[serde(default)]
    eval_count: Option<u32>
  , #[serde(default)]
    error: Option<String>
}

#[derive(Debug, Deserialize)]
struct ResponseMessage
{   #[serde(default)]
    content: String
}

fn error_kind(message: &str) -> ErrorKind
{   if message.contains("not found")
    {   ErrorKind::InvalidRequest
    } else if message.contains("quota") || message.contains("usage limit")
    {   ErrorKind::QuotaExceeded
    } else
    {   ErrorKind::BackendUnavailable
    }
}

/// Ollama chat protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ollama;

impl WireProtocol for Ollama
{   fn descriptor(&self) -> ProviderDescriptor
    {   ProviderDescriptor
        {   id: ProviderId::Ollama
          , default_model: "llama3.2".to_string()
          , requires_credential: false
          , max_context_window: 8_192
          , default_max_tokens: 1024
          , supports_streaming: true
          , cost_per_million_tokens: None
          , description: "Local models served by Ollama; no API key required".to_string()
        }
    }

    fn default_base(&self) -> &'static str
    {   OLLAMA_API_BASE
    }

    fn request(&self, client: &Client, call: &WireCall<'_>) -> RequestBuilder
    {   let mut messages = Vec::with_capacity(call.messages.len() + 1);
        messages.push(Message
        {   role: "system"
          , content: call.system
        });
        messages.extend(call.messages.iter().map(|m| Message
        {   role: match m.role
            {   Role::User => "user"
              , Role::Assistant => "assistant"
            }
          , content: &m.content
        }));

        let body = ChatRequest
        {   model: call.model
          , messages
          , stream: call.stream
          , options: Options
            {   num_predict: call.max_tokens
              , temperature: call.temperature
            }
        };

        client
          .post(format!("{}/api/chat", call.base))
          .json(&body)
    }

    fn parse_completion(&self, body: &str) -> Result<Completion, String>
    {   let response: ChatResponse = serde_json::from_str(body)
          .map_err(|e| format!("invalid Ollama response: {}", e))?;
        if let Some(error) = response.error
        {   return Err(error);
        }
        let text = response.message
          .map(|m| m.content)
          .ok_or_else(|| "response has no message".to_string())?;
        let usage = match (response.prompt_eval_count, response.eval_count)
        {   (Some(input), Some(output)) => Some(TokenUsage::new(input, output))
          , _ => None
        };
        Ok(Completion
        {   text
          , usage
          , stop_reason: response.done_reason.as_deref().map(StopReason::from_backend)
        })
    }

    fn parse_stream_line(&self, line: &str) -> Result<Vec<StreamEvent>, String>
    {   let chunk: ChatResponse = serde_json::from_str(line)
          .map_err(|e| format!("invalid Ollama chunk: {}", e))?;
        if let Some(error) = chunk.error
        {   return Ok(vec![StreamEvent::Failed(error_kind(&error), error)]);
        }

        let mut events = Vec::new();
        if let Some(message) = chunk.message
        {   events.push(StreamEvent::Text(message.content));
        }
        if chunk.done
        {   if let Some(reason) = chunk.done_reason
            {   events.push(StreamEvent::Stop(StopReason::from_backend(&reason)));
            }
            if let Some(input) = chunk.prompt_eval_count
            {   events.push(StreamEvent::InputTokens(input));
            }
            if let Some(output) = chunk.eval_count
            {   events.push(StreamEvent::OutputTokens(output));
            }
            events.push(StreamEvent::Done);
        }
        Ok(events)
    }

    fn probe(&self, client: &Client, base: &str) -> Option<RequestBuilder>
    {   Some(client.get(format!("{}/api/tags", base)))
    }
}
