//! Log multiplexer
//!
//! Every byte source of a build (subprocess stdout and stderr, the container
//! log, exec attach streams) is tailed by its own task. Each complete line is
//! prefixed with the label of the stage that produced it and pushed onto one
//! shared unbounded channel.
//!
//! Lines of a single source keep their order. Lines of different sources may
//! interleave; the stage label tells them apart.
//!
//! A tail stops when its source closes, when reading fails (after emitting a
//! diagnostic line), or when it sees the sentinel line the container bootstrap
//! script prints. The container log never closes while the container is
//! alive, so the sentinel is the only way to know bootstrapping is done.

use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Sending half shared by every source of a build
pub type LogSink = mpsc::UnboundedSender<Vec<u8>>;

/// Receiving half, drained by the output consumer
pub type LogReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Printed by the guest bootstrap script once templates are in place
pub const TEMPLATE_SENTINEL: &str = "finished downloading templates";

/// Longest line kept in memory before the source is considered broken
const MAX_LINE_BYTES: usize = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Creates the per-build log channel
pub fn channel() -> (LogSink, LogReceiver) {
    mpsc::unbounded_channel()
}

/// Pushes a single already-labelled line
pub fn send_line(sink: &LogSink, label: &str, message: &str) {
    let mut line = Vec::with_capacity(label.len() + message.len());
    line.extend_from_slice(label.as_bytes());
    line.extend_from_slice(message.as_bytes());
    // A closed receiver means nobody is listening anymore.
    let _ = sink.send(line);
}

/// Where a tailed source is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Reading,
    SentinelSeen,
    Closed,
    Errored,
}

/// Line splitter and state machine for one source
pub struct SourceTail {
    label: String,
    sentinel: Option<&'static str>,
    sink: LogSink,
    pending: Vec<u8>,
    state: TailState,
}

impl SourceTail {
    pub fn new(label: &str, sink: LogSink) -> Self {
        Self {
            label: label.to_string(),
            sentinel: None,
            sink,
            pending: Vec::new(),
            state: TailState::Reading,
        }
    }

    /// Stops the tail once a line containing `sentinel` has been forwarded
    pub fn with_sentinel(mut self, sentinel: &'static str) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Splits `chunk` into lines and forwards the complete ones
    pub fn feed(&mut self, chunk: &[u8]) -> TailState {
        if self.state != TailState::Reading {
            return self.state;
        }

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if self.emit(&line) {
                self.pending.clear();
                self.state = TailState::SentinelSeen;
                return self.state;
            }
        }

        if self.pending.len() > MAX_LINE_BYTES {
            return self.fail("line too long");
        }

        self.state
    }

    /// The source reached end of stream
    pub fn finish(&mut self) -> TailState {
        if self.state != TailState::Reading {
            return self.state;
        }

        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() && self.emit(&rest) {
            self.state = TailState::SentinelSeen;
        } else {
            self.state = TailState::Closed;
        }
        self.state
    }

    /// Reading the source failed
    pub fn fail(&mut self, err: impl Display) -> TailState {
        if self.state != TailState::Reading {
            return self.state;
        }

        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() {
            self.emit(&rest);
        }
        send_line(
            &self.sink,
            &self.label,
            &format!("something went wrong reading stage output: {}", err),
        );
        self.state = TailState::Errored;
        self.state
    }

    fn emit(&self, line: &[u8]) -> bool {
        let mut out = Vec::with_capacity(self.label.len() + line.len());
        out.extend_from_slice(self.label.as_bytes());
        out.extend_from_slice(line);
        let _ = self.sink.send(out);

        self.sentinel
            .is_some_and(|s| contains(line, s.as_bytes()))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Tails an `AsyncRead` source until it closes, errors or hits the sentinel
pub async fn tail_reader<R>(mut reader: R, mut tail: SourceTail) -> TailState
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let state = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break tail.finish(),
            Ok(n) => {
                let state = tail.feed(&buf[..n]);
                if state != TailState::Reading {
                    break state;
                }
            }
            Err(e) => break tail.fail(e),
        }
    };
    debug!("finished tailing source for {} ({:?})", tail.label, state);
    state
}

/// Tails a chunk stream (container logs, exec output) the same way
pub async fn tail_stream<S, B, E>(mut stream: S, mut tail: SourceTail) -> TailState
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = loop {
        match stream.next().await {
            None => break tail.finish(),
            Some(Ok(chunk)) => {
                let state = tail.feed(chunk.as_ref());
                if state != TailState::Reading {
                    break state;
                }
            }
            Some(Err(e)) => break tail.fail(e),
        }
    };
    debug!("finished tailing stream for {} ({:?})", tail.label, state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn drain(rx: &mut LogReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(String::from_utf8_lossy(&line).to_string());
        }
        lines
    }

    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.sent {
                self.sent = true;
                buf.put_slice(b"partial output\nhalf");
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(io::Error::other("pipe broke")))
        }
    }

    #[test]
    fn test_feed_splits_lines_across_chunks() {
        let (tx, mut rx) = channel();
        let mut tail = SourceTail::new("BUILD | ", tx);

        assert_eq!(tail.feed(b"hel"), TailState::Reading);
        assert_eq!(tail.feed(b"lo\r\nwor"), TailState::Reading);
        assert_eq!(tail.feed(b"ld\n"), TailState::Reading);
        assert_eq!(tail.finish(), TailState::Closed);

        assert_eq!(drain(&mut rx), vec!["BUILD | hello", "BUILD | world"]);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let (tx, mut rx) = channel();
        let mut tail = SourceTail::new("TEST | ", tx);
        tail.feed(b"no newline");
        assert_eq!(tail.finish(), TailState::Closed);
        assert_eq!(drain(&mut rx), vec!["TEST | no newline"]);
    }

    #[test]
    fn test_sentinel_stops_forwarding() {
        let (tx, mut rx) = channel();
        let mut tail = SourceTail::new("SETUP | ", tx).with_sentinel(TEMPLATE_SENTINEL);

        let state = tail.feed(b"unpacking\necho finished downloading templates\nsleeping\n");
        assert_eq!(state, TailState::SentinelSeen);
        assert_eq!(tail.feed(b"more\n"), TailState::SentinelSeen);
        assert_eq!(tail.finish(), TailState::SentinelSeen);

        assert_eq!(
            drain(&mut rx),
            vec![
                "SETUP | unpacking",
                "SETUP | echo finished downloading templates"
            ]
        );
    }

    #[tokio::test]
    async fn test_tail_reader_until_eof() {
        let (tx, mut rx) = channel();
        let source: &[u8] = b"one\ntwo\nthree";
        let state = tail_reader(source, SourceTail::new("BUILD | ", tx)).await;

        assert_eq!(state, TailState::Closed);
        assert_eq!(
            drain(&mut rx),
            vec!["BUILD | one", "BUILD | two", "BUILD | three"]
        );
    }

    #[tokio::test]
    async fn test_tail_reader_error_emits_diagnostic() {
        let (tx, mut rx) = channel();
        let state = tail_reader(FailingReader { sent: false }, SourceTail::new("BUILD | ", tx)).await;

        assert_eq!(state, TailState::Errored);
        let lines = drain(&mut rx);
        assert_eq!(lines[0], "BUILD | partial output");
        assert_eq!(lines[1], "BUILD | half");
        assert!(lines[2].starts_with("BUILD | something went wrong reading stage output"));
        assert!(lines[2].contains("pipe broke"));
    }

    #[tokio::test]
    async fn test_tail_stream_with_sentinel() {
        let (tx, mut rx) = channel();
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, io::Error>(b"downloading\n".to_vec()),
            Ok(b"finished downloading templates\n".to_vec()),
            Ok(b"never seen\n".to_vec()),
        ]);
        let tail = SourceTail::new("SETUP | ", tx).with_sentinel(TEMPLATE_SENTINEL);

        assert_eq!(tail_stream(chunks, tail).await, TailState::SentinelSeen);
        assert_eq!(
            drain(&mut rx),
            vec!["SETUP | downloading", "SETUP | finished downloading templates"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sources_keep_their_own_order() {
        let (tx, mut rx) = channel();
        let out: &'static [u8] = b"o1\no2\no3\n";
        let err: &'static [u8] = b"e1\ne2\ne3\n";

        let a = tokio::spawn(tail_reader(out, SourceTail::new("OUT | ", tx.clone())));
        let b = tokio::spawn(tail_reader(err, SourceTail::new("ERR | ", tx)));
        assert_eq!(a.await.unwrap(), TailState::Closed);
        assert_eq!(b.await.unwrap(), TailState::Closed);

        let lines = drain(&mut rx);
        let outs: Vec<_> = lines.iter().filter(|l| l.starts_with("OUT")).collect();
        let errs: Vec<_> = lines.iter().filter(|l| l.starts_with("ERR")).collect();
        assert_eq!(outs, vec!["OUT | o1", "OUT | o2", "OUT | o3"]);
        assert_eq!(errs, vec!["ERR | e1", "ERR | e2", "ERR | e3"]);
    }
}
