//! Output relay: drains a child's stdout/stderr into a bounded queue
//!
//! One relay task runs per supervised process. It never blocks on the
//! consumer: the queue drops its oldest line when full. Read errors end
//! the affected stream early and are never reported to the supervisor.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured line, without its line terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

struct QueueInner {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    dropped: u64,
    received: u64,
}

/// Bounded queue shared between a relay and its reader.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OutputQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
                received: 0,
            })),
        }
    }

    /// Append a line, evicting the oldest one when full. Never blocks on a reader.
    pub fn push(&self, line: OutputLine) {
        let mut inner = self.inner.lock();
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line);
        inner.received += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    /// Take the oldest line, if any
    pub fn try_pop(&self) -> Option<OutputLine> {
        self.inner.lock().lines.pop_front()
    }

    /// Take every queued line
    pub fn drain(&self) -> Vec<OutputLine> {
        self.inner.lock().lines.drain(..).collect()
    }

    /// Lines evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Lines ever pushed, regardless of eviction or readers
    pub fn received(&self) -> u64 {
        self.inner.lock().received
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutputQueue")
            .field("len", &inner.lines.len())
            .field("capacity", &inner.capacity)
            .field("dropped", &inner.dropped)
            .field("received", &inner.received)
            .finish()
    }
}

type LogSink = Arc<tokio::sync::Mutex<File>>;

/// Handle to the background relay task
#[derive(Debug)]
pub struct OutputRelay {
    handle: JoinHandle<()>,
}

impl OutputRelay {
    /// Start relaying `stdout` and `stderr` into `queue`.
    ///
    /// Lines are also appended to `log_path` when it can be opened.
    pub fn spawn(
        name: String,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        queue: OutputQueue,
        log_path: Option<PathBuf>,
        settle_delay: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let sink = match log_path {
                Some(path) => open_log(&name, path).await,
                None => None,
            };

            tokio::join!(
                drain_stream(&name, StreamKind::Stdout, stdout, &queue, sink.as_ref()),
                drain_stream(&name, StreamKind::Stderr, stderr, &queue, sink.as_ref()),
            );

            if let Some(sink) = &sink {
                let _ = sink.lock().await.flush().await;
            }

            // Let a concurrent reader observe the final lines before the relay goes away
            sleep(settle_delay).await;
            debug!(name = %name, "Output relay finished");
        });

        Self { handle }
    }

    /// Whether both streams closed and the relay exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the relay to exit on its own, aborting it after `timeout`.
    ///
    /// Returns `true` if it exited without being aborted.
    pub async fn join(self, timeout: Duration) -> bool {
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                handle.abort();
                false
            }
        }
    }
}

async fn open_log(name: &str, path: PathBuf) -> Option<LogSink> {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            warn!(name = %name, path = %path.display(), error = %e, "Failed to create log directory");
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(Arc::new(tokio::sync::Mutex::new(file))),
        Err(e) => {
            warn!(name = %name, path = %path.display(), error = %e, "Failed to open process log");
            None
        }
    }
}

async fn drain_stream<R>(
    name: &str,
    stream: StreamKind,
    reader: Option<R>,
    queue: &OutputQueue,
    sink: Option<&LogSink>,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\r', '\n']);
                if text.trim().is_empty() {
                    continue;
                }

                match stream {
                    StreamKind::Stdout => debug!(name = %name, stream = %stream, "{}", text),
                    StreamKind::Stderr => error!(name = %name, stream = %stream, "{}", text),
                }

                if let Some(sink) = sink {
                    let mut file = sink.lock().await;
                    let record = format!("[{stream}] {text}\n");
                    if let Err(e) = file.write_all(record.as_bytes()).await {
                        debug!(name = %name, error = %e, "Failed to write process log");
                    }
                }

                queue.push(OutputLine::new(stream, text));
            }
            Err(e) => {
                debug!(name = %name, stream = %stream, error = %e, "Stream read failed");
                break;
            }
        }
    }

    debug!(name = %name, stream = %stream, "Stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_evicts_oldest_when_full() {
        let queue = OutputQueue::new(2);
        queue.push(OutputLine::new(StreamKind::Stdout, "a"));
        queue.push(OutputLine::new(StreamKind::Stdout, "b"));
        queue.push(OutputLine::new(StreamKind::Stderr, "c"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().text, "b");
        assert_eq!(queue.try_pop().unwrap().text, "c");
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.received(), 3);
    }

    #[test]
    fn test_clones_share_lines() {
        let queue = OutputQueue::new(8);
        let producer = queue.clone();
        producer.push(OutputLine::new(StreamKind::Stdout, "ready"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(producer.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relay_captures_both_streams_and_log() {
        use std::process::Stdio;
        use tokio::process::Command;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested").join("relay.log");

        let mut child = Command::new("sh")
            .args(["-c", "echo one; echo; echo two >&2; echo three"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let queue = OutputQueue::new(16);
        let relay = OutputRelay::spawn(
            "relay-test".into(),
            child.stdout.take(),
            child.stderr.take(),
            queue.clone(),
            Some(log.clone()),
            Duration::from_millis(10),
        );

        child.wait().await.unwrap();
        assert!(relay.join(Duration::from_secs(5)).await);

        let lines = queue.drain();
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(lines.contains(&OutputLine::new(StreamKind::Stderr, "two")));

        let written = std::fs::read_to_string(&log).unwrap();
        assert!(written.contains("[stdout] one"));
        assert!(written.contains("[stderr] two"));
    }

    #[tokio::test]
    async fn test_relay_without_streams_finishes() {
        let queue = OutputQueue::new(4);
        let relay = OutputRelay::spawn(
            "empty".into(),
            None,
            None,
            queue.clone(),
            None,
            Duration::from_millis(1),
        );
        assert!(relay.join(Duration::from_secs(1)).await);
        assert!(queue.is_empty());
    }
}
