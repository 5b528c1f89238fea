//! In-memory response cache with lazy expiry

use log::{debug, trace};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::request::{CanonicalRequest, CanonicalResponse};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry
{   response: CanonicalResponse
  , inserted_at: Instant
}

/// Responses keyed by a hash of question, error type and error message.
///
/// An entry older than the TTL is never returned; it is removed when a
/// lookup finds it, not by a background sweep.
pub struct ResponseCache
{   ttl: Duration
  , entries: Mutex<HashMap<String, CacheEntry>>
}

impl ResponseCache
{   pub fn new(ttl: Duration) -> Self
    {   ResponseCache
        {   ttl
          , entries: Mutex::new(HashMap::new())
        }
    }

    /// Deterministic key. Code context and file path are not part of it.
    pub fn key_for(request: &CanonicalRequest) -> String
    {   let mut hasher = Sha256::new();
        hasher.update(request.question.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.error_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.error_message.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<CanonicalResponse>
    {   let mut entries = self.entries.lock();
        let expired = match entries.get(key)
        {   None => return None
          , Some(entry) => entry.inserted_at.elapsed() > self.ttl
        };
        if expired
        {   debug!("Cache entry {} expired, purging", &key[..12.min(key.len())]);
            entries.remove(key);
            return None;
        }
        trace!("Cache hit for {}", &key[..12.min(key.len())]);
        entries.get(key).map(|entry| entry.response.clone())
    }

    pub fn insert(&self, key: String, response: CanonicalResponse)
    {   self.entries.lock().insert(
          key
        , CacheEntry
          {   response
            , inserted_at: Instant::now()
          }
        );
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize
    {   self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {   self.len() == 0
    }

    pub fn clear(&self)
    {   self.entries.lock().clear();
    }
}

impl Default for ResponseCache
{   fn default() -> Self
    {   ResponseCache::new(DEFAULT_CACHE_TTL)
    }
}
