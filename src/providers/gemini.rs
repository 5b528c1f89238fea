//! Google Gemini `generateContent` API

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::{sse_data, Completion, StreamEvent, WireCall, WireProtocol};
use crate::error::ErrorKind;
use crate::request::{Role, StopReason, TokenUsage};
use crate::{ProviderDescriptor, ProviderId};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a>
{   contents: Vec<Content<'a>>
  , system_instruction: Instruction<'a>
  , generation_config: GenerationConfig
}

#[derive(Debug, Serialize)]
struct Content<'a>
{   role: &'static str
  , parts: [Part<'a>; 1]
}

#[derive(Debug, Serialize)]
struct Instruction<'a>
{   parts: [Part<'a>; 1]
}

#[derive(Debug, Serialize)]
struct Part<'a>
{   text: &'a str
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig
{   max_output_tokens: u32
  , #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse
{   #[serde(default)]
    candidates: Vec<Candidate>
  , #[serde(default)]
    usage_metadata: Option<UsageMetadata>
  , #[serde(default)]
    prompt_feedback: Option<PromptFeedback>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate
{   #[serde(default)]
    content: Option<CandidateContent>
  , #[serde(default)]
    finish_reason: Option<String>
}

#[derive(Debug, Deserialize)]
struct CandidateContent
{   #[serde(default)]
    parts: Vec<CandidatePart>
}

#[derive(Debug, Deserialize)]
struct CandidatePart
{   #[serde(default)]
    text: Option<String>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata
{   #[serde(default)]
    prompt_token_count: Option<u32>
  , #[serde(default)]
    candidates_token_count: Option<u32>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback
{   #[serde(default)]
    block_reason: Option<String>
}

impl Candidate
{   fn text(&self) -> String
    {   self.content
          .iter()
          .flat_map(|c| c.parts.iter())
          .filter_map(|p| p.text.as_deref())
          .collect()
    }
}

/// Gemini reports the finish reason on every final candidate; only
/// `STOP`/`MAX_TOKENS` are normal endings.
fn stop_reason(raw: &str) -> StopReason
{   match raw
    {   "STOP" => StopReason::EndTurn
      , "MAX_TOKENS" => StopReason::MaxTokens
      , other => StopReason::Other(other.to_ascii_lowercase())
    }
}

/// Google Gemini protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gemini;

impl WireProtocol for Gemini
{   fn descriptor(&self) -> ProviderDescriptor
    {   ProviderDescriptor
        {   id: ProviderId::Gemini
          , default_model: "gemini-1.5-flash".to_string()
          , requires_credential: true
          , max_context_window: 1_000_000
          , default_max_tokens: 1024
          , supports_streaming: true
          , cost_per_million_tokens: Some(0.30)
          , description: "Google Gemini models via the Generative Language API".to_string()
        }
    }

    fn default_base(&self) -> &'static str
    {   GEMINI_API_BASE
    }

    fn request(&self, client: &Client, call: &WireCall<'_>) -> RequestBuilder
    {   let body = GenerateRequest
        {   contents: call.messages
              .iter()
              .map(|m| Content
              {   role: match m.role
                  {   Role::User => "user"
                    , Role::Assistant => "model"
                  }
                , parts: [Part { text: &m.content }]
              })
              .collect()
          , system_instruction: Instruction
            {   parts: [Part { text: call.system }]
            }
          , generation_config: GenerationConfig
            {   max_output_tokens: call.max_tokens
              , temperature: call.temperature
            }
        };

        let url = if call.stream
        {   format!("{}/models/{}:streamGenerateContent?alt=sse", call.base, call.model)
        } else
        {   format!("{}/models/{}:generateContent", call.base, call.model)
        };

        client
          .post(url)
          .header("x-goog-api-key", call.secret.unwrap_or_default())
          .json(&body)
    }

    fn parse_completion(&self, body: &str) -> Result<Completion, String>
    {   let response: GenerateResponse = serde_json::from_str(body)
          .map_err(|e| format!("invalid Gemini response: {}", e))?;
        let Some(candidate) = response.candidates.first() else {
          let reason = response.prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates".to_string());
          return Err(format!("Gemini returned no answer ({})", reason));
        };
        let usage = response.usage_metadata.and_then(|u| {
          match (u.prompt_token_count, u.candidates_token_count)
          {   (Some(input), Some(output)) => Some(TokenUsage::new(input, output))
            , _ => None
          }
        });
        Ok(Completion
        {   text: candidate.text()
          , usage
          , stop_reason: candidate.finish_reason.as_deref().map(stop_reason)
        })
    }

    /// The chunk carrying a finish reason is the last one.
    fn parse_stream_line(&self, line: &str) -> Result<Vec<StreamEvent>, String>
    {   let Some(data) = sse_data(line) else { return Ok(vec![]) };
        let chunk: GenerateResponse = serde_json::from_str(data)
          .map_err(|e| format!("invalid Gemini chunk: {}", e))?;

        let mut events = Vec::new();
        let mut finished = false;
        if let Some(candidate) = chunk.candidates.first()
        {   let text = candidate.text();
            if !text.is_empty()
            {   events.push(StreamEvent::Text(text));
            }
            if let Some(reason) = candidate.finish_reason.as_deref()
            {   events.push(StreamEvent::Stop(stop_reason(reason)));
                finished = true;
            }
        }
        if let Some(usage) = chunk.usage_metadata
        {   if let Some(input) = usage.prompt_token_count
            {   events.push(StreamEvent::InputTokens(input));
            }
            if let Some(output) = usage.candidates_token_count
            {   events.push(StreamEvent::OutputTokens(output));
            }
        }
        if finished
        {   events.push(StreamEvent::Done);
        }
        Ok(events)
    }

    fn classify_failure(&self, status: u16, body: &str) -> ErrorKind
    {   if status == 400 && (body.contains("API_KEY_INVALID") || body.contains("API key not valid"))
        {   return ErrorKind::InvalidCredential;
        }
        ErrorKind::from_status(status, body)
    }
}
