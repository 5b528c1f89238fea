//! The orchestration manager: cache, retry, timeout and fallback in front
//! of the provider adapters.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::ResponseCache;
use crate::config::{AssistConfig, ManagerConfig};
use crate::credentials::CredentialAccessor;
use crate::error::{Error, ErrorKind};
use crate::failover::{FailoverSequence, RetryPolicy};
use crate::providers::{build_adapter, ProviderAdapter};
use crate::request::{CanonicalRequest, CanonicalResponse};
use crate::{Capabilities, ProviderId};

/// Snapshot of the manager for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus
{   pub active_provider: ProviderId
  , pub configured_providers: Vec<ProviderId>
  , pub cache_entries: usize
  , pub fallback_enabled: bool
  , pub retry_enabled: bool
  , pub request_timeout_ms: u64
  , pub disposed: bool
}

/// Single entry point for consumers.
///
/// Construct once at startup and share by reference (or `Arc`); every
/// method takes `&self`.
pub struct ProviderManager
{   config: ManagerConfig
  , adapters: Vec<Arc<dyn ProviderAdapter>>
  , /// Fallback order: enabled providers that have an adapter
    order: Vec<ProviderId>
  , active: Mutex<ProviderId>
  , cache: ResponseCache
  , retry: RetryPolicy
  , disposed: AtomicBool
}

impl ProviderManager
{   /// Manager over prebuilt adapters. The default provider starts active
    /// when it has an adapter, otherwise the first adapter does.
    pub fn new(
      config: ManagerConfig
    , adapters: Vec<Arc<dyn ProviderAdapter>>
    ) -> Result<Self, Error>
    {   config.validate()?;
        let first = adapters.first().map(|a| a.id()).ok_or_else(|| {
          Error::InvalidConfiguration("no provider adapters supplied".to_string())
        })?;
        let active = if adapters.iter().any(|a| a.id() == config.default_provider)
        {   config.default_provider
        } else
        {   warn!(
              "Default provider {} has no adapter; starting with {}",
              config.default_provider, first
            );
            first
        };
        let order: Vec<ProviderId> = config
          .enabled_providers
          .iter()
          .copied()
          .filter(|id| adapters.iter().any(|a| a.id() == *id))
          .collect();

        debug!(
          "Creating ProviderManager (active {}, order {:?})",
          active, order
        );
        Ok(ProviderManager
        {   cache: ResponseCache::new(config.cache_ttl())
          , retry: config.retry_policy()
          , config
          , adapters
          , order
          , active: Mutex::new(active)
          , disposed: AtomicBool::new(false)
        })
    }

    /// Build one adapter per enabled provider from a loaded configuration.
    pub fn from_config(
      config: &AssistConfig
    , credentials: Arc<dyn CredentialAccessor>
    ) -> Result<Self, Error>
    {   config.manager.validate()?;
        let client = Client::new();
        let adapters = config.manager
          .enabled_providers
          .iter()
          .map(|id| build_adapter(
            &config.settings_for(*id)
          , credentials.clone()
          , client.clone()
          , config.manager.history_limit
          ))
          .collect();
        ProviderManager::new(config.manager.clone(), adapters)
    }

    /// Check every adapter once and log which are ready.
    pub async fn initialize(&self) -> Vec<(ProviderId, bool)>
    {   let mut readiness = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters
        {   let ready = adapter.is_available().await;
            if ready
            {   info!("{} ready", adapter.descriptor().id.display_name());
            } else
            {   info!("{} not available", adapter.descriptor().id.display_name());
            }
            readiness.push((adapter.id(), ready));
        }
        info!(
          "ProviderManager initialized: {} of {} providers available, active {}",
          readiness.iter().filter(|(_, ready)| *ready).count(),
          readiness.len(),
          self.active_provider()
        );
        readiness
    }

    pub fn active_provider(&self) -> ProviderId
    {   *self.active.lock()
    }

    fn adapter(&self, id: ProviderId) -> Option<&Arc<dyn ProviderAdapter>>
    {   self.adapters.iter().find(|a| a.id() == id)
    }

    /// Cache, then the active provider with retry, then fallback.
    pub async fn send_request(&self, request: &CanonicalRequest) -> CanonicalResponse
    {   let active = self.active_provider();
        if self.disposed.load(Ordering::SeqCst)
        {   return CanonicalResponse::failure(
              active
            , ErrorKind::InvalidRequest
            , "provider manager has been disposed"
            , 0
            );
        }

        let key = ResponseCache::key_for(request);
        if let Some(cached) = self.cache.get(&key)
        {   debug!("Cache hit for {} (served by {})", key, cached.provider_id);
            return cached;
        }

        let Some(primary) = self.adapter(active)
        else
        {   error!("Active provider {} has no adapter", active);
            return CanonicalResponse::failure(
              active
            , ErrorKind::InvalidRequest
            , format!("{} is not configured", active.display_name())
            , 0
            );
        };

        let mut last = None;
        for attempt in 1..=self.retry.max_retries
        {   debug!("Attempt {} on {}", attempt, active);
            let response = self.attempt(primary, request).await;
            if response.success
            {   self.cache.insert(key, response.clone());
                return response;
            }

            let retryable = response.error_kind.is_some_and(|k| k.is_retryable());
            warn!(
              "{} attempt {} failed: {}",
              active,
              attempt,
              response.error.as_deref().unwrap_or_default()
            );
            last = Some(response.with_error_context(&format!(
              "{} (primary, attempt {})",
              active.display_name(),
              attempt
            )));
            if !retryable
            {   debug!("Not retrying {}: failure is not transient", active);
                break;
            }
            if self.retry.has_attempt_after(attempt)
            {   let delay = self.retry.backoff_for_attempt(attempt);
                debug!("Backing off {:?} before retrying {}", delay, active);
                tokio::time::sleep(delay).await;
            }
        }

        if self.config.enable_fallback
        {   let mut sequence = FailoverSequence::new(&self.order, active);
            if sequence.is_empty()
            {   debug!("No fallback candidates besides {}", active);
            }
            let mut candidate = sequence.current();
            while let Some(id) = candidate
            {   candidate = sequence.next();
                let Some(adapter) = self.adapter(id) else { continue };
                if !adapter.is_available().await
                {   debug!("Skipping unavailable fallback {}", id);
                    continue;
                }
                info!("Falling back from {} to {}", active, id);
                let response = self.call_with_timeout(adapter, request).await;
                if response.success
                {   *self.active.lock() = id;
                    info!("{} is now the active provider", id);
                    self.cache.insert(key, response.clone());
                    return response;
                }
                warn!(
                  "Fallback {} failed: {}",
                  id,
                  response.error.as_deref().unwrap_or_default()
                );
                last = Some(response.with_error_context(&format!(
                  "{} (fallback)",
                  id.display_name()
                )));
            }
        }

        last.unwrap_or_else(|| CanonicalResponse::failure(
          active
        , ErrorKind::BackendUnavailable
        , "no attempt was made"
        , 0
        ))
    }

    /// One attempt on the active provider: an unavailable provider fails
    /// without a network call.
    async fn attempt(
      &self
    , adapter: &Arc<dyn ProviderAdapter>
    , request: &CanonicalRequest
    ) -> CanonicalResponse
    {   if !adapter.is_available().await
        {   let descriptor = adapter.descriptor();
            let kind = if descriptor.requires_credential
            {   ErrorKind::MissingCredential
            } else
            {   ErrorKind::BackendUnavailable
            };
            return CanonicalResponse::failure(
              descriptor.id
            , kind
            , format!("{} is not available", descriptor.id.display_name())
            , 0
            );
        }
        self.call_with_timeout(adapter, request).await
    }

    /// Run the call as its own task and race it against the timeout. A
    /// timed-out call is left running; its result is discarded.
    async fn call_with_timeout(
      &self
    , adapter: &Arc<dyn ProviderAdapter>
    , request: &CanonicalRequest
    ) -> CanonicalResponse
    {   let started = Instant::now();
        let task_adapter = Arc::clone(adapter);
        let task_request = request.clone();
        let handle = tokio::spawn(async move {
          task_adapter.send_request(&task_request).await
        });

        match tokio::time::timeout(self.config.request_timeout(), handle).await
        {   Ok(Ok(response)) => response
          , Ok(Err(join_error)) => {
              if join_error.is_panic()
              {   std::panic::resume_unwind(join_error.into_panic());
              }
              CanonicalResponse::failure(
                adapter.id()
              , ErrorKind::BackendUnavailable
              , "request task was cancelled"
              , elapsed_ms(started)
              )
            }
          , Err(_) => self.timed_out(adapter.id(), started)
        }
    }

    fn timed_out(&self, id: ProviderId, started: Instant) -> CanonicalResponse
    {   warn!("{} timed out after {} ms", id, self.config.request_timeout_ms);
        CanonicalResponse::failure(
          id
        , ErrorKind::Timeout
        , format!("no answer within {} ms", self.config.request_timeout_ms)
        , elapsed_ms(started)
        )
    }

    /// Stream from the active provider. No cache, no retry, no fallback;
    /// a call that times out is dropped.
    pub async fn send_request_streaming(
      &self
    , request: &CanonicalRequest
    , on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
    , cancel: &CancellationToken
    ) -> CanonicalResponse
    {   let active = self.active_provider();
        if self.disposed.load(Ordering::SeqCst)
        {   return CanonicalResponse::failure(
              active
            , ErrorKind::InvalidRequest
            , "provider manager has been disposed"
            , 0
            );
        }
        let Some(adapter) = self.adapter(active)
        else
        {   return CanonicalResponse::failure(
              active
            , ErrorKind::InvalidRequest
            , format!("{} is not configured", active.display_name())
            , 0
            );
        };
        let started = Instant::now();
        match tokio::time::timeout(
          self.config.request_timeout()
        , adapter.send_request_streaming(request, on_chunk, cancel)
        ).await
        {   Ok(response) => response
          , Err(_) => self.timed_out(active, started)
        }
    }

    /// Make `id` the active provider. Fails, leaving the active provider
    /// unchanged, when `id` has no adapter or is not available.
    pub async fn switch_provider(&self, id: ProviderId) -> Result<(), Error>
    {   let adapter = self.adapter(id).ok_or(Error::ProviderNotConfigured(id))?;
        if !adapter.is_available().await
        {   warn!("Refusing to switch to unavailable provider {}", id);
            return Err(Error::ProviderUnavailable(id));
        }
        let previous = std::mem::replace(&mut *self.active.lock(), id);
        info!("Switched active provider from {} to {}", previous, id);
        Ok(())
    }

    /// Live availability re-check of every configured adapter.
    pub async fn get_available_providers(&self) -> Vec<ProviderId>
    {   let mut available = Vec::new();
        for adapter in &self.adapters
        {   if adapter.is_available().await
            {   available.push(adapter.id());
            }
        }
        available
    }

    pub async fn get_capabilities(&self) -> Vec<Capabilities>
    {   let mut capabilities = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters
        {   capabilities.push(adapter.capabilities().await);
        }
        capabilities
    }

    pub async fn set_credentials(&self, id: ProviderId, secret: String) -> Result<(), Error>
    {   let adapter = self.adapter(id).ok_or(Error::ProviderNotConfigured(id))?;
        adapter.set_credentials(secret).await
    }

    pub async fn clear_credentials(&self, id: ProviderId) -> Result<(), Error>
    {   let adapter = self.adapter(id).ok_or(Error::ProviderNotConfigured(id))?;
        adapter.clear_credentials().await
    }

    pub fn clear_cache(&self)
    {   debug!("Clearing response cache ({} entries)", self.cache.len());
        self.cache.clear();
    }

    pub fn clear_history(&self)
    {   for adapter in &self.adapters
        {   adapter.clear_history();
        }
    }

    pub fn get_status(&self) -> ManagerStatus
    {   ManagerStatus
        {   active_provider: self.active_provider()
          , configured_providers: self.adapters.iter().map(|a| a.id()).collect()
          , cache_entries: self.cache.len()
          , fallback_enabled: self.config.enable_fallback
          , retry_enabled: self.config.enable_retry
          , request_timeout_ms: self.config.request_timeout_ms
          , disposed: self.disposed.load(Ordering::SeqCst)
        }
    }

    /// Drop cached answers and histories. Later requests fail.
    pub fn dispose(&self)
    {   if self.disposed.swap(true, Ordering::SeqCst)
        {   return;
        }
        self.clear_cache();
        self.clear_history();
        info!("ProviderManager disposed");
    }
}

fn elapsed_ms(started: Instant) -> u64
{   started.elapsed().as_millis() as u64
}
