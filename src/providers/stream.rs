//! Incremental line decoding for chunked event streams

use futures::{Stream, StreamExt};
use log::{debug, trace, warn};
use std::fmt::Display;
use tokio_util::sync::CancellationToken;

use super::StreamEvent;
use crate::error::ErrorKind;
use crate::request::StopReason;

/// Splits raw bytes into lines, holding the trailing partial line until its
/// terminator arrives. Bytes are decoded only once a line is complete, so a
/// multi-byte character split across reads survives intact.
#[derive(Debug, Default)]
pub struct LineBuffer
{   pending: Vec<u8>
}

impl LineBuffer
{   pub fn new() -> Self
    {   LineBuffer::default()
    }

    /// Feed bytes; returns every line completed by them, without `\n` or
    /// a preceding `\r`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String>
    {   self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n')
        {   let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r')
            {   line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Bytes of the unterminated line, if any.
    pub fn remainder(&self) -> &[u8]
    {   &self.pending
    }
}

/// Aggregate of a consumed stream.
#[derive(Debug, Default)]
pub struct StreamOutcome
{   pub text: String
  , pub input_tokens: Option<u32>
  , pub output_tokens: Option<u32>
  , pub stop_reason: Option<StopReason>
  , pub cancelled: bool
}

/// Failure while reading a stream.
#[derive(Debug)]
pub struct StreamFailure
{   pub kind: ErrorKind
  , pub message: String
}

/// Read `body` to its end, the protocol's done sentinel, or cancellation.
///
/// `parse` receives each complete, non-empty line. Malformed lines are
/// logged and skipped. Text events reach `on_chunk` in arrival order; none
/// are delivered once `cancel` has fired.
pub async fn drive<S, B, E, P>(
  body: S
, mut parse: P
, on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send)
, cancel: &CancellationToken
) -> Result<StreamOutcome, StreamFailure>
where
  S: Stream<Item = Result<B, E>>
, B: AsRef<[u8]>
, E: Display
, P: FnMut(&str) -> Result<Vec<StreamEvent>, String>
{   let mut body = std::pin::pin!(body);
    let mut lines = LineBuffer::new();
    let mut outcome = StreamOutcome::default();

    'read: loop
    {   let next = tokio::select!
        {   biased;
            _ = cancel.cancelled() => {
              debug!("Stream cancelled after {} chars", outcome.text.len());
              outcome.cancelled = true;
              break 'read;
            }
          , next = body.next() => next
        };

        let bytes = match next
        {   None => break 'read
          , Some(Err(e)) => {
              return Err(StreamFailure
              {   kind: ErrorKind::BackendUnavailable
                , message: format!("stream interrupted: {}", e)
              });
            }
          , Some(Ok(bytes)) => bytes
        };

        for line in lines.push(bytes.as_ref())
        {   let line = line.trim();
            if line.is_empty()
            {   continue;
            }
            trace!("stream line: {}", line);
            let events = match parse(line)
            {   Ok(events) => events
              , Err(e) => {
                  warn!("Skipping malformed stream line: {}", e);
                  continue;
                }
            };
            for event in events
            {   match event
                {   StreamEvent::Text(text) => {
                      if cancel.is_cancelled()
                      {   outcome.cancelled = true;
                          break 'read;
                      }
                      if !text.is_empty()
                      {   on_chunk(&text);
                          outcome.text.push_str(&text);
                      }
                    }
                  , StreamEvent::InputTokens(n) => outcome.input_tokens = Some(n)
                  , StreamEvent::OutputTokens(n) => outcome.output_tokens = Some(n)
                  , StreamEvent::Stop(reason) => outcome.stop_reason = Some(reason)
                  , StreamEvent::Done => {
                      trace!("stream sentinel reached");
                      break 'read;
                    }
                  , StreamEvent::Failed(kind, message) => {
                      return Err(StreamFailure { kind, message });
                    }
                }
            }
        }
    }

    if !outcome.cancelled && !lines.remainder().is_empty()
    {   debug!(
          "Discarding {} bytes of unterminated stream data",
          lines.remainder().len()
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests
{   use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn parse_plain(line: &str) -> Result<Vec<StreamEvent>, String>
    {   match line
        {   "END" => Ok(vec![StreamEvent::Done])
          , "???" => Err("bad line".to_string())
          , "FAIL" => Ok(vec![StreamEvent::Failed(
              ErrorKind::RateLimited
            , "slow".to_string()
            )])
          , text => Ok(vec![StreamEvent::Text(text.to_string())])
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], Infallible>>
    {   stream::iter(
          parts
            .iter()
            .copied()
            .map(|p: &'static str| Ok::<_, Infallible>(p.as_bytes()))
            .collect::<Vec<_>>()
        )
    }

    #[test]
    fn partial_lines_wait_for_terminator()
    {   let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.remainder(), b"data: {\"a\"");
        assert_eq!(buf.push(b":1}\r\ndata: x\n"), vec!["data: {\"a\":1}", "data: x"]);
        assert!(buf.remainder().is_empty());
    }

    #[test]
    fn multibyte_char_split_across_reads()
    {   let mut buf = LineBuffer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo"]);
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_and_sentinel_stops()
    {   let mut seen = Vec::new();
        let mut sink = |t: &str| seen.push(t.to_string());
        let outcome = drive(
          chunks(&["Hel", "lo\n???\nwor", "ld\nEND\nignored\n"])
        , parse_plain
        , &mut sink
        , &CancellationToken::new()
        ).await.unwrap();
        assert_eq!(seen, vec!["Hello", "world"]);
        assert_eq!(outcome.text, "Helloworld");
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn in_stream_failure_is_reported()
    {   let mut sink = |_: &str| {};
        let failure = drive(
          chunks(&["ok\nFAIL\n"])
        , parse_plain
        , &mut sink
        , &CancellationToken::new()
        ).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn cancelled_token_stops_delivery()
    {   let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0;
        let mut sink = |_: &str| count += 1;
        let outcome = drive(chunks(&["a\nb\n"]), parse_plain, &mut sink, &cancel)
          .await
          .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(count, 0);
        assert!(outcome.text.is_empty());
    }
}
