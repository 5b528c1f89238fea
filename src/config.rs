//! Configuration for providers and failover behavior

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::failover::RetryPolicy;
use crate::ProviderId;

/// Per-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings
{   /// Provider identifier
    pub id: ProviderId
  , /// Model name; the provider default when absent
    #[serde(default)]
    pub model: Option<String>
  , /// API base URL (if custom)
    #[serde(default)]
    pub api_base: Option<String>
  , /// Completion budget when the request sets none
    #[serde(default)]
    pub max_tokens: Option<u32>
}

impl ProviderSettings
{   pub fn new(id: ProviderId) -> Self
    {   ProviderSettings
        {   id
          , model: None
          , api_base: None
          , max_tokens: None
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self
    {   self.api_base = Some(api_base.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self
    {   self.model = Some(model.into());
        self
    }
}

/// Manager configuration. Fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig
{   /// Provider that serves requests first
    pub default_provider: ProviderId
  , /// Try other providers once the active one gives up
    pub enable_fallback: bool
  , /// Fallback order; also the set of providers built by `from_config`
    pub enabled_providers: Vec<ProviderId>
  , /// Per-call timeout in milliseconds
    pub request_timeout_ms: u64
  , /// Retry transient failures on the active provider
    pub enable_retry: bool
  , /// Attempts on the active provider when retry is enabled
    pub max_retries: usize
  , /// Backoff before the second attempt in milliseconds
    pub retry_base_delay_ms: u64
  , /// Backoff growth per attempt
    pub backoff_multiplier: f32
  , /// Response cache lifetime in seconds
    pub cache_ttl_secs: u64
  , /// Entries kept per conversation key
    pub history_limit: usize
}

impl Default for ManagerConfig
{   fn default() -> Self
    {   ManagerConfig
        {   default_provider: ProviderId::Anthropic
          , enable_fallback: true
          , enabled_providers: ProviderId::ALL.to_vec()
          , request_timeout_ms: 30_000
          , enable_retry: true
          , max_retries: 3
          , retry_base_delay_ms: 1_000
          , backoff_multiplier: 2.0
          , cache_ttl_secs: 300
          , history_limit: crate::history::DEFAULT_HISTORY_LIMIT
        }
    }
}

impl ManagerConfig
{   pub fn request_timeout(&self) -> Duration
    {   Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration
    {   Duration::from_secs(self.cache_ttl_secs)
    }

    /// Attempts on the active provider; a single attempt when retry is off.
    pub fn retry_policy(&self) -> RetryPolicy
    {   if self.enable_retry
        {   RetryPolicy::new(
              self.max_retries
            , self.backoff_multiplier
            , self.retry_base_delay_ms
            )
        } else
        {   RetryPolicy::single_attempt()
        }
    }

    pub fn validate(&self) -> Result<(), Error>
    {   if self.enabled_providers.is_empty()
        {   return Err(Error::InvalidConfiguration(
              "at least one provider must be enabled".to_string()
            ));
        }
        for (i, id) in self.enabled_providers.iter().enumerate()
        {   if self.enabled_providers[..i].contains(id)
            {   return Err(Error::InvalidConfiguration(
                  format!("provider {} listed twice", id)
                ));
            }
        }
        if self.request_timeout_ms == 0
        {   return Err(Error::InvalidConfiguration(
              "request_timeout_ms must be positive".to_string()
            ));
        }
        if self.enable_retry && self.max_retries == 0
        {   return Err(Error::InvalidConfiguration(
              "max_retries must be at least 1 when retry is enabled".to_string()
            ));
        }
        if self.backoff_multiplier < 1.0
        {   return Err(Error::InvalidConfiguration(
              "backoff_multiplier must be >= 1.0".to_string()
            ));
        }
        if self.history_limit < 2 || self.history_limit % 2 != 0
        {   return Err(Error::InvalidConfiguration(
              "history_limit must be a positive even number".to_string()
            ));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistConfig
{   /// Manager configuration
    #[serde(default)]
    pub manager: ManagerConfig
  , /// Provider configurations
    #[serde(default)]
    pub providers: Vec<ProviderSettings>
}

impl AssistConfig
{   pub fn from_json_str(json: &str) -> Result<Self, Error>
    {   let config: AssistConfig = serde_json::from_str(json)?;
        config.manager.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error>
    {   let text = std::fs::read_to_string(path)?;
        AssistConfig::from_json_str(&text)
    }

    /// Settings for `id`, or defaults when the file has none.
    pub fn settings_for(&self, id: ProviderId) -> ProviderSettings
    {   self.providers
          .iter()
          .find(|p| p.id == id)
          .cloned()
          .unwrap_or_else(|| ProviderSettings::new(id))
    }
}
