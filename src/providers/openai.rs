use serde::{Deserialize, Serialize};
use reqwest::{Client, RequestBuilder};

use super::{sse_data, Completion, StreamEvent, WireCall, WireProtocol};
use crate::request::{Role, StopReason, TokenUsage};
use crate::{ProviderDescriptor, ProviderId};

const OPENAI_API_BASE: &str
  = "https://api.openai.com/v1";

// ===== Message Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: String
  , #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions
{   pub include_usage: bool
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest
{   pub model: String
  , pub messages: Vec<ChatMessage>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse
{   #[serde(default)]
    pub choices: Vec<Choice>
  , #[serde(default)]
    pub usage: Option<Usage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: ChatMessage
  , pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage
{   pub prompt_tokens: u32
  , pub completion_tokens: u32
}

// ===== Stream Types =====

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk
{   #[serde(default)]
    pub choices: Vec<ChunkChoice>
  , #[serde(default)]
    pub usage: Option<Usage>
  , #[serde(default)]
    pub error: Option<ApiError>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice
{   #[serde(default)]
    pub delta: Delta
  , pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError
{   pub message: String
  , #[serde(default, rename = "type")]
    pub kind: Option<String>
  , #[serde(default)]
    pub code: Option<String>
}

/// OpenAI Chat Completions protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAi;

fn role_name(role: Role) -> &'static str
{   match role
    {   Role::User => "user"
      , Role::Assistant => "assistant"
    }
}

impl WireProtocol for OpenAi
{   fn descriptor(&self) -> ProviderDescriptor
    {   ProviderDescriptor
        {   id: ProviderId::OpenAi
          , default_model: "gpt-4o-mini".to_string()
          , requires_credential: true
          , max_context_window: 128_000
          , default_max_tokens: 1024
          , supports_streaming: true
          , cost_per_million_tokens: Some(0.60)
          , description: "OpenAI GPT models via the Chat Completions API".to_string()
        }
    }

    fn default_base(&self) -> &'static str
    {   OPENAI_API_BASE
    }

    fn request(&self, client: &Client, call: &WireCall<'_>) -> RequestBuilder
    {   let mut messages = Vec::with_capacity(call.messages.len() + 1);
        messages.push(ChatMessage
        {   role: "system".to_string()
          , content: Some(call.system.to_string())
        });
        messages.extend(call.messages.iter().map(|m| ChatMessage
        {   role: role_name(m.role).to_string()
          , content: Some(m.content.clone())
        }));

        let body = ChatRequest
        {   model: call.model.to_string()
          , messages
          , max_tokens: Some(call.max_tokens)
          , temperature: call.temperature
          , stream: call.stream.then_some(true)
          , stream_options: call.stream.then_some(StreamOptions { include_usage: true })
        };

        client
          .post(format!("{}/chat/completions", call.base))
          .bearer_auth(call.secret.unwrap_or_default())
          .json(&body)
    }

    fn parse_completion(&self, body: &str) -> Result<Completion, String>
    {   let response: ChatResponse = serde_json::from_str(body)
          .map_err(|e| format!("invalid OpenAI response: {}", e))?;
        let choice = response.choices
          .into_iter()
          .next()
          .ok_or_else(|| "API response contained no choices".to_string())?;
        let text = choice.message.content
          .ok_or_else(|| "choice has no message content".to_string())?;
        Ok(Completion
        {   text
          , usage: response.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
          , stop_reason: choice.finish_reason.as_deref().map(StopReason::from_backend)
        })
    }

    fn parse_stream_line(&self, line: &str) -> Result<Vec<StreamEvent>, String>
    {   let Some(data) = sse_data(line) else { return Ok(vec![]) };
        if data.trim() == "[DONE]"
        {   return Ok(vec![StreamEvent::Done]);
        }
        let chunk: ChatChunk = serde_json::from_str(data)
          .map_err(|e| format!("invalid OpenAI chunk: {}", e))?;

        if let Some(error) = chunk.error
        {   let kind = match error.code.as_deref().or(error.kind.as_deref())
            {   Some("insufficient_quota") => crate::error::ErrorKind::QuotaExceeded
              , Some("rate_limit_exceeded") => crate::error::ErrorKind::RateLimited
              , _ => crate::error::ErrorKind::BackendUnavailable
            };
            return Ok(vec![StreamEvent::Failed(kind, error.message)]);
        }

        let mut events = Vec::new();
        for choice in chunk.choices
        {   if let Some(content) = choice.delta.content
            {   events.push(StreamEvent::Text(content));
            }
            if let Some(reason) = choice.finish_reason
            {   events.push(StreamEvent::Stop(StopReason::from_backend(&reason)));
            }
        }
        if let Some(usage) = chunk.usage
        {   events.push(StreamEvent::InputTokens(usage.prompt_tokens));
            events.push(StreamEvent::OutputTokens(usage.completion_tokens));
        }
        Ok(events)
    }
}
