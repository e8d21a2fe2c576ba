//! Build output capture and the on-disk log sink.
//!
//! Every build owns one [`BuildLog`], a line-oriented ring buffer that the
//! clone step and the process runner push into. A background flusher
//! snapshots the buffer to a [`LogSink`] every few seconds; at build
//! teardown the flusher is cancelled and one final snapshot is written.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{BuildNumber, ProjectId};

const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Notifier summaries carry at most this many trailing lines.
const TAIL_LINES: usize = 20;

/// Hard byte cap on a tail, on top of the line count.
const TAIL_BYTES: usize = 4 * 1024;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Line-oriented ring buffer for one build's output.
///
/// Oldest lines fall off once the byte cap is exceeded, so a runaway build
/// command cannot grow the process without bound. All methods take `&self`;
/// the buffer is shared between the producing tasks and the flusher.
#[derive(Debug)]
pub struct BuildLog {
    inner: Mutex<LogBuffer>,
}

#[derive(Debug)]
struct LogBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl BuildLog {
    pub fn new(max_bytes: usize) -> Self {
        BuildLog {
            inner: Mutex::new(LogBuffer {
                lines: VecDeque::new(),
                bytes: 0,
                max_bytes,
            }),
        }
    }

    /// Appends one line, evicting the oldest lines if the cap is exceeded.
    /// The newest line is always kept, even when it is larger than the cap
    /// on its own.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        let mut buffer = self.lock();
        buffer.bytes += line.len() + 1;
        buffer.lines.push_back(line);
        while buffer.bytes > buffer.max_bytes && buffer.lines.len() > 1 {
            if let Some(dropped) = buffer.lines.pop_front() {
                buffer.bytes -= dropped.len() + 1;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// The full buffered log as one newline-terminated string.
    pub fn snapshot(&self) -> String {
        let buffer = self.lock();
        let mut out = String::with_capacity(buffer.bytes);
        for line in &buffer.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// The trailing slice shown in failure notifications: the last 20 lines,
    /// capped at 4 KiB.
    pub fn tail(&self) -> String {
        let buffer = self.lock();
        let skip = buffer.lines.len().saturating_sub(TAIL_LINES);
        let mut out = String::new();
        for line in buffer.lines.iter().skip(skip) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
        if out.len() > TAIL_BYTES {
            let mut cut = out.len() - TAIL_BYTES;
            while !out.is_char_boundary(cut) {
                cut += 1;
            }
            out.drain(..cut);
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BuildLog {
    fn default() -> Self {
        BuildLog::new(MAX_LOG_BYTES)
    }
}

/// Where full log snapshots go.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Stable location of a build's log. Known before any bytes are written,
    /// which is what lets it double as the build's public log URL.
    fn location(&self, project: &ProjectId, build_num: BuildNumber) -> String;

    async fn write(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
        contents: &str,
    ) -> std::io::Result<()>;
}

/// Log sink writing `<root>/<project>/builds/<n>/log.txt`.
///
/// The root must live outside the build directory, which is wiped before
/// every clone.
#[derive(Debug, Clone)]
pub struct FsLogSink {
    root: PathBuf,
}

impl FsLogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsLogSink { root: root.into() }
    }

    fn path(&self, project: &ProjectId, build_num: BuildNumber) -> PathBuf {
        self.root
            .join(project.as_str())
            .join("builds")
            .join(build_num.to_string())
            .join("log.txt")
    }
}

#[async_trait]
impl LogSink for FsLogSink {
    fn location(&self, project: &ProjectId, build_num: BuildNumber) -> String {
        self.path(project, build_num).display().to_string()
    }

    async fn write(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
        contents: &str,
    ) -> std::io::Result<()> {
        let path = self.path(project, build_num);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await
    }
}

/// Spawns the periodic log flusher for one build.
///
/// Snapshots the log to the sink every few seconds until `stop` is
/// cancelled, then writes one final snapshot before returning. Callers
/// await the handle after cancelling so the last flush lands. Write errors
/// are logged and the flusher keeps going.
pub fn spawn_flusher(
    sink: Arc<dyn LogSink>,
    log: Arc<BuildLog>,
    project: ProjectId,
    build_num: BuildNumber,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                    flush(sink.as_ref(), &log, &project, build_num).await;
                }
            }
        }
        flush(sink.as_ref(), &log, &project, build_num).await;
    })
}

async fn flush(sink: &dyn LogSink, log: &BuildLog, project: &ProjectId, build_num: BuildNumber) {
    if log.is_empty() {
        return;
    }
    if let Err(error) = sink.write(project, build_num, &log.snapshot()).await {
        tracing::warn!(%project, %build_num, %error, "log flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ─── Ring buffer ──────────────────────────────────────────────────────────

    #[test]
    fn snapshot_joins_lines_in_order() {
        let log = BuildLog::default();
        log.push("$ make");
        log.push("compiling");
        log.push("done");
        assert_eq!(log.snapshot(), "$ make\ncompiling\ndone\n");
        assert!(!log.is_empty());
    }

    #[test]
    fn oldest_lines_are_evicted_past_the_cap() {
        let log = BuildLog::new(32);
        log.push("first line here");
        log.push("second line here");
        log.push("third line here");
        let snapshot = log.snapshot();
        assert!(!snapshot.contains("first"));
        assert!(snapshot.contains("third"));
    }

    #[test]
    fn an_oversized_line_is_still_kept() {
        let log = BuildLog::new(8);
        log.push("x".repeat(100));
        assert_eq!(log.snapshot().trim_end().len(), 100);
    }

    #[test]
    fn tail_returns_the_last_twenty_lines() {
        let log = BuildLog::default();
        for i in 0..30 {
            log.push(format!("line-{i}"));
        }
        let tail = log.tail();
        assert!(tail.starts_with("line-10"));
        assert!(tail.ends_with("line-29"));
        assert!(!tail.contains("line-9\n"));
    }

    #[test]
    fn tail_is_byte_capped_from_the_front() {
        let log = BuildLog::default();
        log.push("a".repeat(3000));
        log.push("b".repeat(3000));
        log.push("c".repeat(3000));
        let tail = log.tail();
        assert!(tail.len() <= 4096);
        assert!(tail.ends_with(&"c".repeat(3000)));
        assert!(!tail.contains('a'));
    }

    #[test]
    fn tail_cuts_on_char_boundaries() {
        let log = BuildLog::default();
        log.push("€".repeat(2500));
        let tail = log.tail();
        assert!(tail.len() <= 4096);
        assert!(tail.chars().all(|c| c == '€'));
    }

    // ─── Sink and flusher ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn fs_sink_writes_under_project_and_build_number() {
        let root = TempDir::new().unwrap();
        let sink = FsLogSink::new(root.path());
        let project = ProjectId::new("gh/octocat/hello");

        sink.write(&project, BuildNumber(7), "hello\n").await.unwrap();

        let expected = root
            .path()
            .join("gh/octocat/hello/builds/7/log.txt");
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "hello\n");
        assert_eq!(
            sink.location(&project, BuildNumber(7)),
            expected.display().to_string()
        );
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn last(&self) -> Option<String> {
            self.writes.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        fn location(&self, project: &ProjectId, build_num: BuildNumber) -> String {
            format!("memory://{project}/{build_num}")
        }

        async fn write(
            &self,
            _project: &ProjectId,
            _build_num: BuildNumber,
            contents: &str,
        ) -> std::io::Result<()> {
            self.writes.lock().unwrap().push(contents.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_snapshots_periodically_and_once_more_on_stop() {
        let sink = Arc::new(RecordingSink::default());
        let log = Arc::new(BuildLog::default());
        let stop = CancellationToken::new();
        let handle = spawn_flusher(
            sink.clone(),
            log.clone(),
            ProjectId::new("gh/o/r"),
            BuildNumber(1),
            stop.clone(),
        );

        // Nothing buffered yet: the first interval writes nothing.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.last(), None);

        log.push("first");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.last(), Some("first\n".to_string()));

        log.push("second");
        stop.cancel();
        handle.await.unwrap();
        assert_eq!(sink.last(), Some("first\nsecond\n".to_string()));
    }
}
