//! Failover and retry logic for provider fallbacks

use std::time::Duration;
use log::debug;

use crate::ProviderId;

/// Retry policy for failed requests on one provider
#[derive(Debug, Clone)]
pub struct RetryPolicy
{   /// Total attempts on the active provider (at least 1)
    pub max_retries: usize
  , pub backoff_multiplier: f32
  , pub initial_backoff: Duration
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(
      max_retries: usize
    , backoff_multiplier: f32
    , initial_backoff_ms: u64
    ) -> Self
    {   RetryPolicy
        {   max_retries: max_retries.max(1)
          , backoff_multiplier
          , initial_backoff: Duration::from_millis(
              initial_backoff_ms
            )
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn single_attempt() -> Self
    {   RetryPolicy::new(1, 1.0, 0)
    }

    /// Sleep after failed attempt `attempt` (1-based):
    /// `initial * multiplier^(attempt - 1)`.
    pub fn backoff_for_attempt(
      &self
    , attempt: usize
    ) -> Duration
    {   debug!("Calculating backoff for attempt {}", attempt);
        let exponent = attempt.saturating_sub(1) as i32;
        let multiplier
          = self.backoff_multiplier.powi(exponent);
        Duration::from_millis(
          (self.initial_backoff.as_millis() as f32
            * multiplier) as u64
        )
    }

    /// Whether another attempt follows attempt `attempt` (1-based).
    pub fn has_attempt_after(&self, attempt: usize) -> bool
    {   attempt < self.max_retries
    }
}

/// Fallback candidates tried once each after the active provider gives up
#[derive(Debug, Clone)]
pub struct FailoverSequence
{   pub providers: Vec<ProviderId>
  , pub current_index: usize
}

impl FailoverSequence
{   /// Configured order with `active` removed
    pub fn new(
      configured: &[ProviderId]
    , active: ProviderId
    ) -> Self
    {   let providers: Vec<ProviderId> = configured
          .iter()
          .copied()
          .filter(|id| *id != active)
          .collect();
        debug!(
          "Creating failover sequence with {} providers",
          providers.len()
        );
        FailoverSequence
        {   providers
          , current_index: 0
        }
    }

    /// Get the current provider
    pub fn current(&self) -> Option<ProviderId>
    {   self.providers.get(self.current_index).copied()
    }

    /// Move to the next provider
    pub fn next(&mut self) -> Option<ProviderId>
    {   self.current_index += 1;
        self.current()
    }

    pub fn is_empty(&self) -> bool
    {   self.providers.is_empty()
    }
}
