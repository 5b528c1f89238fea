//! Credential accessor boundary
//!
//! Secrets live in an external store. Adapters fetch a transient copy per
//! call through [`CredentialAccessor`] and never log it.

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Error;
use crate::request::Validation;
use crate::ProviderId;

#[async_trait]
pub trait CredentialAccessor: Send + Sync
{   /// The stored secret, or `None` when nothing is stored.
    async fn get(&self, provider: ProviderId) -> Result<Option<String>, Error>;

    async fn set(&self, provider: ProviderId, secret: String) -> Result<(), Error>;

    /// Remove a secret. Deleting a missing secret is not an error.
    async fn delete(&self, provider: ProviderId) -> Result<(), Error>;

    /// Local shape check only; no network call.
    fn validate_format(&self, provider: ProviderId, secret: &str) -> Validation
    {   validate_secret_format(provider, secret)
    }
}

/// Default shape rules for each backend's API keys.
pub fn validate_secret_format(provider: ProviderId, secret: &str) -> Validation
{   if provider == ProviderId::Ollama
    {   return Validation::ok();
    }
    let secret = secret.trim();
    if secret.is_empty()
    {   return Validation::failed("API key is empty");
    }
    if secret.chars().any(char::is_whitespace)
    {   return Validation::failed("API key must not contain whitespace");
    }
    let (prefix, min_len) = match provider
    {   ProviderId::Anthropic => ("sk-ant-", 20)
      , ProviderId::OpenAi => ("sk-", 20)
      , ProviderId::Gemini => ("AIza", 30)
      , ProviderId::Ollama => ("", 0)
    };
    if !secret.starts_with(prefix)
    {   return Validation::failed(format!(
          "{} API keys start with \"{}\""
        , provider.display_name()
        , prefix
        ));
    }
    if secret.len() < min_len
    {   return Validation::failed(format!(
          "{} API key is too short"
        , provider.display_name()
        ));
    }
    Validation::ok()
}

/// Environment variable conventionally holding each provider's key.
pub fn env_var_for(provider: ProviderId) -> Option<&'static str>
{   match provider
    {   ProviderId::Anthropic => Some("ANTHROPIC_API_KEY")
      , ProviderId::OpenAi => Some("OPENAI_API_KEY")
      , ProviderId::Gemini => Some("GEMINI_API_KEY")
      , ProviderId::Ollama => None
    }
}

/// Process-lifetime credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentials
{   secrets: RwLock<HashMap<ProviderId, String>>
}

impl MemoryCredentials
{   pub fn new() -> Self
    {   MemoryCredentials::default()
    }

    /// Seed from `ANTHROPIC_API_KEY`, `OPENAI_API_KEY` and `GEMINI_API_KEY`.
    pub fn from_env() -> Self
    {   let store = MemoryCredentials::new();
        {   let mut secrets = store.secrets.write();
            for provider in ProviderId::ALL
            {   let Some(var) = env_var_for(provider) else { continue };
                if let Ok(secret) = std::env::var(var)
                {   if !secret.trim().is_empty()
                    {   debug!("Loaded credential for {} from {}", provider, var);
                        secrets.insert(provider, secret.trim().to_string());
                    }
                }
            }
        }
        store
    }

    pub fn with_secret(self, provider: ProviderId, secret: impl Into<String>) -> Self
    {   self.secrets.write().insert(provider, secret.into());
        self
    }
}

#[async_trait]
impl CredentialAccessor for MemoryCredentials
{   async fn get(&self, provider: ProviderId) -> Result<Option<String>, Error>
    {   Ok(self.secrets.read().get(&provider).cloned())
    }

    async fn set(&self, provider: ProviderId, secret: String) -> Result<(), Error>
    {   debug!("Storing credential for {}", provider);
        self.secrets.write().insert(provider, secret);
        Ok(())
    }

    async fn delete(&self, provider: ProviderId) -> Result<(), Error>
    {   debug!("Deleting credential for {}", provider);
        self.secrets.write().remove(&provider);
        Ok(())
    }
}
