use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use debug_assist::providers::{stream_by_buffering, ProviderAdapter};
use debug_assist::
{   CanonicalRequest
  , CanonicalResponse
  , Error
  , ErrorKind
  , ManagerConfig
  , ProviderDescriptor
  , ProviderId
  , ProviderManager
  , StopReason
  , TokenUsage
  , Validation
};

/// What a scripted adapter does on one call.
#[derive(Debug, Clone)]
enum Step
{   Answer(&'static str)
  , Fail(ErrorKind)
  , Hang
}

/// In-memory adapter that replays a script, then repeats `otherwise`.
struct ScriptedAdapter
{   descriptor: ProviderDescriptor
  , available: AtomicBool
  , script: Mutex<VecDeque<Step>>
  , otherwise: Step
  , calls: AtomicUsize
  , history_clears: AtomicUsize
}

impl ScriptedAdapter
{   fn new(id: ProviderId, otherwise: Step) -> Arc<Self>
    {   Arc::new(ScriptedAdapter::build(id, otherwise, true))
    }

    /// Adapter whose backend has no stream endpoint.
    fn buffered(id: ProviderId, otherwise: Step) -> Arc<Self>
    {   Arc::new(ScriptedAdapter::build(id, otherwise, false))
    }

    fn build(id: ProviderId, otherwise: Step, supports_streaming: bool) -> Self
    {   ScriptedAdapter
        {   descriptor: ProviderDescriptor
            {   id
              , default_model: "scripted".to_string()
              , requires_credential: true
              , max_context_window: 1000
              , default_max_tokens: 100
              , supports_streaming
              , cost_per_million_tokens: None
              , description: "scripted test adapter".to_string()
            }
          , available: AtomicBool::new(true)
          , script: Mutex::new(VecDeque::new())
          , otherwise
          , calls: AtomicUsize::new(0)
          , history_clears: AtomicUsize::new(0)
        }
    }

    fn with_script(self: Arc<Self>, steps: Vec<Step>) -> Arc<Self>
    {   self.script.lock().extend(steps);
        self
    }

    fn unavailable(self: Arc<Self>) -> Arc<Self>
    {   self.available.store(false, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> usize
    {   self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
          .lock()
          .pop_front()
          .unwrap_or_else(|| self.otherwise.clone())
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter
{   fn id(&self) -> ProviderId
    {   self.descriptor.id
    }

    fn descriptor(&self) -> &ProviderDescriptor
    {   &self.descriptor
    }

    async fn is_available(&self) -> bool
    {   self.available.load(Ordering::SeqCst)
    }

    async fn send_request(&self, _request: &CanonicalRequest) -> CanonicalResponse
    {   match self.next_step()
        {   Step::Answer(text) => CanonicalResponse::success(
              self.descriptor.id
            , text.to_string()
            , TokenUsage::new(40, 12)
            , Some(StopReason::EndTurn)
            , 1
            )
          , Step::Fail(kind) => CanonicalResponse::failure(
              self.descriptor.id
            , kind
            , "scripted failure"
            , 1
            )
          , Step::Hang => std::future::pending::<CanonicalResponse>().await
        }
    }

    async fn send_request_streaming(
      &self
    , request: &CanonicalRequest
    , on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
    , cancel: &CancellationToken
    ) -> CanonicalResponse
    {   if !self.descriptor.supports_streaming
        {   return stream_by_buffering(self, request, on_chunk).await;
        }
        if let Step::Hang = self.otherwise
        {   self.calls.fetch_add(1, Ordering::SeqCst);
            return std::future::pending::<CanonicalResponse>().await;
        }
        let mut text = String::new();
        for chunk in ["Hello, ", "world!"]
        {   if cancel.is_cancelled()
            {   return CanonicalResponse::success(
                  self.descriptor.id
                , text
                , TokenUsage::default()
                , Some(StopReason::Cancelled)
                , 1
                );
            }
            on_chunk(chunk);
            text.push_str(chunk);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        CanonicalResponse::success(
          self.descriptor.id
        , text
        , TokenUsage::new(3, 4)
        , Some(StopReason::EndTurn)
        , 1
        )
    }

    async fn validate(&self) -> Validation
    {   Validation::ok()
    }

    async fn set_credentials(&self, _secret: String) -> Result<(), Error>
    {   self.available.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_credentials(&self) -> Result<(), Error>
    {   self.available.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn clear_history(&self)
    {   self.history_clears.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(providers: &[ProviderId]) -> ManagerConfig
{   ManagerConfig
    {   default_provider: providers[0]
      , enabled_providers: providers.to_vec()
      , ..ManagerConfig::default()
    }
}

fn manager(config: ManagerConfig, adapters: &[Arc<ScriptedAdapter>]) -> ProviderManager
{   let adapters: Vec<Arc<dyn ProviderAdapter>> = adapters
      .iter()
      .map(|a| a.clone() as Arc<dyn ProviderAdapter>)
      .collect();
    ProviderManager::new(config, adapters).unwrap()
}

fn question(text: &str) -> CanonicalRequest
{   CanonicalRequest::new(
      text
    , "const u=undefined; u.name"
    , "Cannot read property 'name' of undefined"
    , "app.ts"
    , "Runtime Error"
    )
}

fn assert_consistent(response: &CanonicalResponse)
{   assert_eq!(response.success, response.error.is_none());
    assert_eq!(response.success, response.error_kind.is_none());
    if !response.success
    {   assert!(response.text.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn cache_serves_repeats_until_ttl_expires()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("cached answer"));
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary.clone()]);

    let first = manager.send_request(&question("Why undefined?")).await;
    let second = manager.send_request(&question("Why undefined?")).await;
    assert!(first.success);
    assert_eq!(first, second);
    assert_eq!(primary.calls(), 1);
    assert_eq!(manager.get_status().cache_entries, 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    let third = manager.send_request(&question("Why undefined?")).await;
    assert!(third.success);
    assert_ne!(third.id, first.id);
    assert_eq!(primary.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_cached()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("second try"))
      .with_script(vec![Step::Fail(ErrorKind::InvalidRequest)]);
    let manager = manager(
      ManagerConfig
      {   enable_fallback: false
        , ..config(&[ProviderId::Anthropic])
      }
    , &[primary.clone()]
    );

    assert!(!manager.send_request(&question("q")).await.success);
    assert_eq!(manager.get_status().cache_entries, 0);
    assert!(manager.send_request(&question("q")).await.success);
    assert_eq!(primary.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_exponential_backoff()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("third time lucky"))
      .with_script(vec![
        Step::Fail(ErrorKind::BackendUnavailable)
      , Step::Fail(ErrorKind::RateLimited)
      ]);
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary.clone()]);

    let started = Instant::now();
    let response = manager.send_request(&question("retry me")).await;
    assert!(response.success);
    assert_eq!(response.text, "third time lucky");
    assert_eq!(primary.calls(), 3);
    // 1000 ms after the first failure, 2000 ms after the second
    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert!(started.elapsed() < Duration::from_millis(3100));
}

#[tokio::test(start_paused = true)]
async fn configuration_failures_are_not_retried()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Fail(ErrorKind::InvalidCredential));
    let manager = manager(
      ManagerConfig
      {   enable_fallback: false
        , ..config(&[ProviderId::Anthropic])
      }
    , &[primary.clone()]
    );

    let started = Instant::now();
    let response = manager.send_request(&question("bad key")).await;
    assert_consistent(&response);
    assert_eq!(primary.calls(), 1);
    assert_eq!(response.error_kind, Some(ErrorKind::InvalidCredential));
    let error = response.error.unwrap();
    assert!(error.starts_with("Anthropic Claude (primary, attempt 1): invalid_credential"), "{}", error);
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn fallback_skips_unavailable_and_sticks_to_winner()
{   let a = ScriptedAdapter::new(ProviderId::Anthropic, Step::Fail(ErrorKind::BackendUnavailable));
    let b = ScriptedAdapter::new(ProviderId::OpenAi, Step::Answer("from b")).unavailable();
    let c = ScriptedAdapter::new(ProviderId::Gemini, Step::Answer("from c"));
    let manager = manager(
      config(&[ProviderId::Anthropic, ProviderId::OpenAi, ProviderId::Gemini])
    , &[a.clone(), b.clone(), c.clone()]
    );

    let response = manager.send_request(&question("fallback?")).await;
    assert!(response.success);
    assert_eq!(response.provider_id, ProviderId::Gemini);
    assert_eq!(response.text, "from c");
    assert_eq!(manager.active_provider(), ProviderId::Gemini);
    assert_eq!(a.calls(), 3);
    assert_eq!(b.calls(), 0);
    assert_eq!(c.calls(), 1);

    let next = manager.send_request(&question("something else")).await;
    assert_eq!(next.provider_id, ProviderId::Gemini);
    assert_eq!(a.calls(), 3);
    assert_eq!(c.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_credential_falls_back_without_retrying()
{   let a = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("never")).unavailable();
    let b = ScriptedAdapter::new(ProviderId::OpenAi, Step::Answer("Because `u` is undefined before access."));
    let manager = manager(
      config(&[ProviderId::Anthropic, ProviderId::OpenAi])
    , &[a.clone(), b.clone()]
    );

    let started = Instant::now();
    let response = manager.send_request(&question("Why undefined?")).await;
    assert!(response.success);
    assert_eq!(response.provider_id, ProviderId::OpenAi);
    assert_eq!(response.token_usage.total, 52);
    assert_eq!(a.calls(), 0);
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn exhausted_fallback_returns_last_failure()
{   let a = ScriptedAdapter::new(ProviderId::Anthropic, Step::Fail(ErrorKind::QuotaExceeded));
    let b = ScriptedAdapter::new(ProviderId::OpenAi, Step::Fail(ErrorKind::MalformedResponse));
    let manager = manager(
      config(&[ProviderId::Anthropic, ProviderId::OpenAi])
    , &[a.clone(), b.clone()]
    );

    let response = manager.send_request(&question("nothing works")).await;
    assert_consistent(&response);
    assert_eq!(response.provider_id, ProviderId::OpenAi);
    assert_eq!(response.error_kind, Some(ErrorKind::MalformedResponse));
    assert!(response.error.unwrap().starts_with("OpenAI (fallback): malformed_response"));
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(manager.active_provider(), ProviderId::Anthropic);
}

#[tokio::test(start_paused = true)]
async fn hung_call_times_out_on_schedule()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Hang);
    let manager = manager(
      ManagerConfig
      {   enable_fallback: false
        , enable_retry: false
        , request_timeout_ms: 500
        , ..config(&[ProviderId::Anthropic])
      }
    , &[primary.clone()]
    );

    let started = Instant::now();
    let response = manager.send_request(&question("hello?")).await;
    let elapsed = started.elapsed();
    assert_consistent(&response);
    assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(550));
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("finally"))
      .with_script(vec![Step::Hang]);
    let manager = manager(
      ManagerConfig
      {   request_timeout_ms: 200
        , retry_base_delay_ms: 100
        , ..config(&[ProviderId::Anthropic])
      }
    , &[primary.clone()]
    );

    let started = Instant::now();
    let response = manager.send_request(&question("slow")).await;
    assert!(response.success);
    assert_eq!(primary.calls(), 2);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn switch_provider_requires_availability()
{   let a = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("a"));
    let b = ScriptedAdapter::new(ProviderId::OpenAi, Step::Answer("b")).unavailable();
    let c = ScriptedAdapter::new(ProviderId::Gemini, Step::Answer("c"));
    let manager = manager(
      config(&[ProviderId::Anthropic, ProviderId::OpenAi, ProviderId::Gemini])
    , &[a, b.clone(), c]
    );

    assert!(matches!(
      manager.switch_provider(ProviderId::OpenAi).await
    , Err(Error::ProviderUnavailable(ProviderId::OpenAi))
    ));
    assert_eq!(manager.active_provider(), ProviderId::Anthropic);

    assert!(matches!(
      manager.switch_provider(ProviderId::Ollama).await
    , Err(Error::ProviderNotConfigured(ProviderId::Ollama))
    ));
    assert_eq!(manager.active_provider(), ProviderId::Anthropic);

    manager.switch_provider(ProviderId::Gemini).await.unwrap();
    assert_eq!(manager.active_provider(), ProviderId::Gemini);

    manager.set_credentials(ProviderId::OpenAi, "sk-test".to_string()).await.unwrap();
    manager.switch_provider(ProviderId::OpenAi).await.unwrap();
    assert_eq!(manager.active_provider(), ProviderId::OpenAi);
}

#[tokio::test]
async fn available_providers_are_rechecked_live()
{   let a = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("a"));
    let b = ScriptedAdapter::new(ProviderId::OpenAi, Step::Answer("b")).unavailable();
    let manager = manager(
      config(&[ProviderId::Anthropic, ProviderId::OpenAi])
    , &[a, b]
    );

    assert_eq!(
      manager.initialize().await
    , vec![(ProviderId::Anthropic, true), (ProviderId::OpenAi, false)]
    );
    assert_eq!(manager.get_available_providers().await, vec![ProviderId::Anthropic]);

    manager.set_credentials(ProviderId::OpenAi, "sk-now-set".to_string()).await.unwrap();
    assert_eq!(
      manager.get_available_providers().await
    , vec![ProviderId::Anthropic, ProviderId::OpenAi]
    );
    let capabilities = manager.get_capabilities().await;
    assert!(capabilities.iter().all(|c| c.available));
}

#[tokio::test]
async fn streaming_passes_chunks_through_without_caching()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("unused"));
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary.clone()]);

    let mut chunks = Vec::new();
    let response = manager
      .send_request_streaming(
        &question("stream it")
      , &mut |chunk: &str| chunks.push(chunk.to_string())
      , &CancellationToken::new()
      )
      .await;

    assert!(response.success);
    assert_eq!(chunks, vec!["Hello, ", "world!"]);
    assert_eq!(response.text, "Hello, world!");
    assert_eq!(manager.get_status().cache_entries, 0);
}

#[tokio::test]
async fn cancelled_stream_is_a_partial_success()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("unused"));
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut chunks = 0;
    let response = manager
      .send_request_streaming(&question("stop"), &mut |_: &str| chunks += 1, &cancel)
      .await;

    assert_consistent(&response);
    assert!(response.success);
    assert_eq!(response.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(chunks, 0);
}

#[tokio::test(start_paused = true)]
async fn hung_stream_times_out()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Hang);
    let manager = manager(
      ManagerConfig
      {   request_timeout_ms: 250
        , ..config(&[ProviderId::Anthropic])
      }
    , &[primary.clone()]
    );

    let response = manager
      .send_request_streaming(&question("wait"), &mut |_: &str| {}, &CancellationToken::new())
      .await;
    assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn buffered_stream_delivers_the_whole_answer_once()
{   let primary = ScriptedAdapter::buffered(ProviderId::Ollama, Step::Answer("the full answer"));
    let manager = manager(config(&[ProviderId::Ollama]), &[primary.clone()]);

    let mut chunks = Vec::new();
    let response = manager
      .send_request_streaming(
        &question("no stream endpoint")
      , &mut |chunk: &str| chunks.push(chunk.to_string())
      , &CancellationToken::new()
      )
      .await;

    assert_consistent(&response);
    assert!(response.success);
    assert_eq!(chunks, vec!["the full answer"]);
    assert_eq!(response.text, "the full answer");
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn buffered_stream_failure_emits_no_chunks()
{   let primary = ScriptedAdapter::buffered(ProviderId::Ollama, Step::Fail(ErrorKind::BackendUnavailable));
    let manager = manager(config(&[ProviderId::Ollama]), &[primary.clone()]);

    let mut chunks = 0;
    let response = manager
      .send_request_streaming(&question("no stream endpoint"), &mut |_: &str| chunks += 1, &CancellationToken::new())
      .await;

    assert_consistent(&response);
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::BackendUnavailable));
    assert_eq!(chunks, 0);
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn dispose_clears_state_and_rejects_work()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("answer"));
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary.clone()]);

    assert!(manager.send_request(&question("before")).await.success);
    assert_eq!(manager.get_status().cache_entries, 1);

    manager.dispose();
    manager.dispose();
    let status = manager.get_status();
    assert!(status.disposed);
    assert_eq!(status.cache_entries, 0);
    assert_eq!(primary.history_clears.load(Ordering::SeqCst), 1);

    let after = manager.send_request(&question("before")).await;
    assert_consistent(&after);
    assert!(!after.success);
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn disposed_manager_rejects_streams()
{   let primary = ScriptedAdapter::new(ProviderId::Anthropic, Step::Answer("unused"));
    let manager = manager(config(&[ProviderId::Anthropic]), &[primary.clone()]);
    manager.dispose();

    let mut chunks = 0;
    let response = manager
      .send_request_streaming(&question("after"), &mut |_: &str| chunks += 1, &CancellationToken::new())
      .await;

    assert_consistent(&response);
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::InvalidRequest));
    assert_eq!(chunks, 0);
    assert_eq!(primary.calls(), 0);
}

#[test]
fn construction_rejects_bad_input()
{   assert!(matches!(
      ProviderManager::new(ManagerConfig::default(), vec![])
    , Err(Error::InvalidConfiguration(_))
    ));

    let only_gemini = ScriptedAdapter::new(ProviderId::Gemini, Step::Answer("g"));
    let manager = manager(ManagerConfig::default(), &[only_gemini]);
    let status = manager.get_status();
    assert_eq!(status.active_provider, ProviderId::Gemini);
    assert_eq!(status.configured_providers, vec![ProviderId::Gemini]);
}
