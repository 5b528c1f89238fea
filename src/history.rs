//! Bounded per-conversation message log

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::request::{ConversationEntry, Role};

/// Five user/assistant exchanges.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// History keyed by conversation key (usually a file path).
///
/// `len(key) <= limit` holds after every append; the oldest entries are
/// dropped first, and a log never starts with an assistant turn.
#[derive(Debug)]
pub struct ConversationHistory
{   limit: usize
  , entries: Mutex<HashMap<String, VecDeque<ConversationEntry>>>
}

impl ConversationHistory
{   pub fn new(limit: usize) -> Self
    {   ConversationHistory
        {   limit: limit.max(2)
          , entries: Mutex::new(HashMap::new())
        }
    }

    /// Record one exchange, then trim from the front.
    pub fn append(
      &self
    , key: &str
    , user_message: impl Into<String>
    , assistant_message: impl Into<String>
    )
    {   let mut entries = self.entries.lock();
        let log = entries.entry(key.to_string()).or_default();
        log.push_back(ConversationEntry::user(user_message));
        log.push_back(ConversationEntry::assistant(assistant_message));
        while log.len() > self.limit
          || log.front().is_some_and(|entry| entry.role == Role::Assistant)
        {   log.pop_front();
        }
    }

    /// Entries for `key` in insertion order; empty when unknown.
    pub fn get(&self, key: &str) -> Vec<ConversationEntry>
    {   self.entries
          .lock()
          .get(key)
          .map(|log| log.iter().cloned().collect())
          .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize
    {   self.entries.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn clear(&self)
    {   self.entries.lock().clear();
    }
}

impl Default for ConversationHistory
{   fn default() -> Self
    {   ConversationHistory::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn unknown_key_is_empty()
    {   let history = ConversationHistory::default();
        assert!(history.get("nope.rs").is_empty());
        assert_eq!(history.len("nope.rs"), 0);
    }

    #[test]
    fn keeps_most_recent_five_exchanges_in_order()
    {   let history = ConversationHistory::default();
        for i in 0..8
        {   history.append("a.ts", format!("q{i}"), format!("a{i}"));
        }
        let log = history.get("a.ts");
        assert_eq!(log.len(), 10);
        let contents: Vec<&str> = log.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(
          contents
        , vec!["q3", "a3", "q4", "a4", "q5", "a5", "q6", "a6", "q7", "a7"]
        );
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[9].role, Role::Assistant);
    }

    #[test]
    fn odd_limit_trims_whole_exchanges()
    {   let history = ConversationHistory::new(9);
        for i in 0..6
        {   history.append("odd.rs", format!("q{i}"), format!("a{i}"));
        }
        let log = history.get("odd.rs");
        assert_eq!(log.len(), 8);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[0].content, "q2");
        assert_eq!(log[7].content, "a5");
    }

    #[test]
    fn keys_are_independent_and_clear_resets_all()
    {   let history = ConversationHistory::default();
        history.append("a.ts", "q", "a");
        history.append("b.ts", "q", "a");
        history.append("b.ts", "q2", "a2");
        assert_eq!(history.len("a.ts"), 2);
        assert_eq!(history.len("b.ts"), 4);
        history.clear();
        assert!(history.get("a.ts").is_empty());
        assert!(history.get("b.ts").is_empty());
    }
}
