use crate::collectors::distributor::{EventDistributor, Subscriptions, DEFAULT_BUFFER_CAPACITY};
use crate::error::TailerError;
use crate::events::LogEvent;
use crate::parser::LogParser;
use crate::worker::{StopSignal, Worker};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A readable, seekable file whose current size can be queried
pub trait TailableFile: Read + Seek + Send {
    /// Current size of the underlying file in bytes
    fn size(&self) -> io::Result<u64>;
}

impl TailableFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// What to do with the rest of a batch when one line fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    /// Skip the bad line and leave the remaining lines for the next poll
    #[default]
    DeferRemainder,
    /// Skip only the bad line and keep reading the batch
    SkipLine,
}

/// How the file changed since the previous poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    Unchanged,
    Grown,
    /// Size went down: the file was truncated or replaced
    Truncated,
    /// Size is the same but lines were left unread by an earlier poll
    Pending,
}

/// Synchronous core of the tailer: tracks the read offset over one file
///
/// Each [`poll`](Self::poll) reads the complete lines that appeared since the
/// previous one and parses them.
#[derive(Debug)]
pub struct LogTail<F> {
    file: F,
    /// Byte offset just past the last consumed line
    offset: u64,
    /// File size observed by the previous poll
    last_size: u64,
    /// Complete lines below `last_size` are still unread
    pending: bool,
    policy: ParseFailurePolicy,
}

impl<F: TailableFile> LogTail<F> {
    /// Begin tailing `file`, either from its current end or from the start
    pub fn new(file: F, start_at_end: bool, policy: ParseFailurePolicy) -> io::Result<Self> {
        let size = file.size()?;
        let offset = if start_at_end { size } else { 0 };
        Ok(Self {
            file,
            offset,
            last_size: size,
            pending: offset < size,
            policy,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    fn detect_change(&self, size: u64) -> FileChange {
        if size < self.last_size {
            FileChange::Truncated
        } else if size > self.last_size {
            FileChange::Grown
        } else if self.pending {
            FileChange::Pending
        } else {
            FileChange::Unchanged
        }
    }

    /// Read and parse every complete line added since the last poll
    ///
    /// A shrinking file is treated as replaced and re-read from offset 0.
    /// A trailing line without its newline is left for a later poll.
    ///
    /// # Errors
    ///
    /// Any stat, seek or read failure is returned as-is; the tail should not
    /// be polled again afterwards.
    pub fn poll(&mut self, parser: &dyn LogParser) -> io::Result<Vec<LogEvent>> {
        let size = self.file.size()?;
        match self.detect_change(size) {
            FileChange::Unchanged => return Ok(Vec::new()),
            FileChange::Truncated => {
                info!(
                    "Log file shrank from {} to {} bytes, reading from the start",
                    self.last_size, size
                );
                self.offset = 0;
            }
            FileChange::Grown | FileChange::Pending => {}
        }
        self.last_size = size;
        self.pending = false;

        if self.offset >= size {
            return Ok(Vec::new());
        }

        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut buffer = Vec::new();
        Read::by_ref(&mut self.file)
            .take(size - self.offset)
            .read_to_end(&mut buffer)?;

        let (events, consumed, aborted) = self.parse_lines(&buffer, parser);
        self.offset += consumed as u64;
        self.pending = aborted && self.offset < size;

        debug!(
            "Read {} event(s), offset now {} of {} bytes",
            events.len(),
            self.offset,
            size
        );
        Ok(events)
    }

    /// Parse complete lines from `buffer`
    ///
    /// Returns the events, the number of bytes consumed and whether the batch
    /// was cut short by a parse failure.
    fn parse_lines(&self, buffer: &[u8], parser: &dyn LogParser) -> (Vec<LogEvent>, usize, bool) {
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(newline) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + newline];
            consumed += newline + 1;

            let line = String::from_utf8_lossy(raw);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            match parser.parse(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("Failed to parse log line '{}': {}", line, e);
                    if self.policy == ParseFailurePolicy::DeferRemainder {
                        return (events, consumed, true);
                    }
                }
            }
        }

        (events, consumed, false)
    }
}

/// Settings for a [`FileTailer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerConfig {
    /// How often the file is checked for growth
    pub poll_interval: Duration,
    /// Events buffered per subscriber before the tailer blocks
    pub buffer_capacity: usize,
    /// Skip content that exists when tailing starts
    pub start_at_end: bool,
    pub parse_failure_policy: ParseFailurePolicy,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            start_at_end: true,
            parse_failure_policy: ParseFailurePolicy::default(),
        }
    }
}

/// Polls a growing log file and fans parsed events out to subscribers
///
/// Runs a background thread that owns the file handle, the read offset and
/// the distributor. Stopping the tailer, or a fatal I/O error, closes every
/// subscriber stream. A tailer runs at most once.
pub struct FileTailer {
    path: PathBuf,
    parser: Arc<dyn LogParser>,
    config: TailerConfig,
    subscriptions: Subscriptions,
    /// Present until the background thread takes ownership of it
    distributor: Option<EventDistributor>,
    worker: Option<Worker<Result<(), TailerError>>>,
}

impl FileTailer {
    /// Create a tailer for `path`; nothing is opened until [`start`](Self::start)
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use trafficwatch::collectors::{FileTailer, TailerConfig};
    /// use trafficwatch::parser::CommonLogParser;
    ///
    /// let mut tailer = FileTailer::new(
    ///     "/var/log/access.log",
    ///     Arc::new(CommonLogParser::new()),
    ///     TailerConfig::default(),
    /// );
    /// let events = tailer.subscribe().unwrap();
    /// tailer.start().unwrap();
    /// ```
    pub fn new(path: impl Into<PathBuf>, parser: Arc<dyn LogParser>, config: TailerConfig) -> Self {
        let (distributor, subscriptions) = EventDistributor::new(config.buffer_capacity);
        Self {
            path: path.into(),
            parser,
            config,
            subscriptions,
            distributor: Some(distributor),
            worker: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new event stream
    ///
    /// Streams opened before `start` see every event; later ones see events
    /// published after they subscribed.
    pub fn subscribe(&self) -> Result<Receiver<LogEvent>, TailerError> {
        Ok(self.subscriptions.subscribe()?)
    }

    /// Cloneable handle for subscribing from elsewhere
    pub fn subscriptions(&self) -> Subscriptions {
        self.subscriptions.clone()
    }

    /// Open the file and start the polling thread
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` on a second start, `Finished` once the tailer has been
    /// stopped, `Open` if the file cannot be opened.
    pub fn start(&mut self) -> Result<(), TailerError> {
        if self.worker.is_some() {
            return Err(TailerError::AlreadyRunning(self.path.clone()));
        }
        let distributor = self
            .distributor
            .take()
            .ok_or_else(|| TailerError::Finished(self.path.clone()))?;

        let tail = match File::open(&self.path).and_then(|file| {
            LogTail::new(
                file,
                self.config.start_at_end,
                self.config.parse_failure_policy,
            )
        }) {
            Ok(tail) => tail,
            Err(source) => {
                self.distributor = Some(distributor);
                return Err(TailerError::Open {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let path = self.path.clone();
        let parser = Arc::clone(&self.parser);
        let interval = self.config.poll_interval;
        let worker = Worker::spawn("file-tailer", move |stop| {
            tail_loop(&path, tail, parser.as_ref(), distributor, interval, stop)
        })
        .map_err(|e| TailerError::Spawn(e.to_string()))?;

        self.worker = Some(worker);
        info!(
            "FileTailer started on {} (poll every {:?})",
            self.path.display(),
            interval
        );
        Ok(())
    }

    /// Stop polling and close all subscriber streams
    ///
    /// # Errors
    ///
    /// `NotRunning` if the tailer was never started or was already stopped;
    /// otherwise the fatal I/O error that ended the thread, if any.
    pub fn stop(&mut self) -> Result<(), TailerError> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| TailerError::NotRunning(self.path.clone()))?;

        let result = worker.stop().map_err(TailerError::Panicked)?;
        info!("FileTailer on {} stopped", self.path.display());
        result
    }

    /// Whether the polling thread is still alive
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for FileTailer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!("FileTailer on {} ended with error: {}", self.path.display(), e);
            }
        }
    }
}

/// Body of the tailer thread
///
/// Polls until stopped or until an I/O error, then closes the distributor so
/// every subscriber sees end-of-stream.
fn tail_loop<F: TailableFile>(
    path: &Path,
    mut tail: LogTail<F>,
    parser: &dyn LogParser,
    mut distributor: EventDistributor,
    interval: Duration,
    stop: StopSignal,
) -> Result<(), TailerError> {
    debug!("Tailer thread for {} running", path.display());

    let result = 'poll: loop {
        if stop.is_stopped() {
            break Ok(());
        }

        match tail.poll(parser) {
            Ok(events) => {
                for event in &events {
                    if stop.is_stopped() {
                        break 'poll Ok(());
                    }
                    if let Err(e) = distributor.publish(event, &stop) {
                        debug!("Publishing interrupted: {}", e);
                        break 'poll Ok(());
                    }
                }
            }
            Err(e) => {
                error!("Tailing {} failed: {}", path.display(), e);
                break Err(TailerError::IoError(e));
            }
        }

        if stop.sleep(interval) {
            break Ok(());
        }
    };

    distributor.close();
    info!("Tailer thread for {} finished", path.display());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::parser::{CommonLogParser, MockLogParser};
    use chrono::Utc;
    use std::fs::OpenOptions;
    use std::io::{Cursor, Write};
    use crossbeam_channel::{RecvTimeoutError, TryRecvError};
    use tempfile::NamedTempFile;

    /// Parser that accepts lines starting with '/' as resource paths
    fn path_parser() -> MockLogParser {
        let mut parser = MockLogParser::new();
        parser.expect_parse().returning(|line| {
            if line.starts_with('/') {
                Ok(LogEvent::new(Utc::now(), line))
            } else {
                Err(ParseError::Malformed(line.to_string()))
            }
        });
        parser
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn paths(events: Vec<LogEvent>) -> Vec<String> {
        events.into_iter().map(|e| e.resource_path).collect()
    }

    fn open_tail(temp: &NamedTempFile, start_at_end: bool, policy: ParseFailurePolicy) -> LogTail<File> {
        LogTail::new(File::open(temp.path()).unwrap(), start_at_end, policy).unwrap()
    }

    #[test]
    fn test_start_at_end_skips_existing_content() {
        let temp = NamedTempFile::new().unwrap();
        append(temp.path(), "/old\n");
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        assert!(tail.poll(&parser).unwrap().is_empty());
        append(temp.path(), "/new\n");
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/new"]);
    }

    #[test]
    fn test_start_at_beginning_reads_existing_content_once() {
        let temp = NamedTempFile::new().unwrap();
        append(temp.path(), "/old\n/older\n");
        let parser = path_parser();
        let mut tail = open_tail(&temp, false, ParseFailurePolicy::DeferRemainder);

        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/old", "/older"]);
        assert!(tail.poll(&parser).unwrap().is_empty());
        assert_eq!(tail.offset(), 12);
    }

    #[test]
    fn test_unchanged_file_is_not_reparsed() {
        let temp = NamedTempFile::new().unwrap();
        let mut parser = MockLogParser::new();
        parser
            .expect_parse()
            .times(1)
            .returning(|line| Ok(LogEvent::new(Utc::now(), line)));
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        append(temp.path(), "/once\n");
        assert_eq!(tail.poll(&parser).unwrap().len(), 1);
        assert!(tail.poll(&parser).unwrap().is_empty());
        assert!(tail.poll(&parser).unwrap().is_empty());
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let temp = NamedTempFile::new().unwrap();
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        append(temp.path(), "/par");
        assert!(tail.poll(&parser).unwrap().is_empty());
        assert_eq!(tail.offset(), 0);

        append(temp.path(), "tial\n");
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/partial"]);
        assert_eq!(tail.offset(), 9);
    }

    #[test]
    fn test_shrunk_file_is_read_from_offset_zero() {
        let temp = NamedTempFile::new().unwrap();
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        append(temp.path(), "/one\n/two\n/three\n");
        assert_eq!(tail.poll(&parser).unwrap().len(), 3);
        assert_eq!(tail.offset(), 17);

        std::fs::write(temp.path(), "/x\n").unwrap();
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/x"]);
        assert_eq!(tail.offset(), 3);
        assert_eq!(tail.last_size(), 3);
    }

    #[test]
    fn test_parse_failure_defers_rest_of_batch() {
        let temp = NamedTempFile::new().unwrap();
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        append(temp.path(), "/a\nbad\n/b\n/c\n");
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/a"]);
        // Size did not change, but the deferred lines are read on the next tick
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/b", "/c"]);
        assert!(tail.poll(&parser).unwrap().is_empty());
    }

    #[test]
    fn test_skip_line_policy_keeps_reading() {
        let temp = NamedTempFile::new().unwrap();
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::SkipLine);

        append(temp.path(), "/a\nbad\n/b\n");
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/a", "/b"]);
    }

    #[test]
    fn test_blank_lines_and_crlf_are_tolerated() {
        let temp = NamedTempFile::new().unwrap();
        let parser = path_parser();
        let mut tail = open_tail(&temp, true, ParseFailurePolicy::DeferRemainder);

        append(temp.path(), "/a\r\n\n   \n/b\n");
        assert_eq!(paths(tail.poll(&parser).unwrap()), vec!["/a", "/b"]);
    }

    /// In-memory file whose size query fails after a number of calls
    struct FlakyFile {
        inner: Cursor<Vec<u8>>,
        healthy_stats: std::cell::Cell<u32>,
    }

    impl Read for FlakyFile {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Seek for FlakyFile {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl TailableFile for FlakyFile {
        fn size(&self) -> io::Result<u64> {
            let remaining = self.healthy_stats.get();
            if remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "stat failed"));
            }
            self.healthy_stats.set(remaining - 1);
            Ok(self.inner.get_ref().len() as u64)
        }
    }

    #[test]
    fn test_io_failure_ends_loop_and_closes_streams() {
        let file = FlakyFile {
            inner: Cursor::new(b"/a\n".to_vec()),
            healthy_stats: std::cell::Cell::new(2),
        };
        let tail = LogTail::new(file, false, ParseFailurePolicy::DeferRemainder).unwrap();
        let (distributor, subscriptions) = EventDistributor::new(4);
        let receiver = subscriptions.subscribe().unwrap();
        let parser = path_parser();

        let result = tail_loop(
            Path::new("flaky.log"),
            tail,
            &parser,
            distributor,
            Duration::from_millis(1),
            StopSignal::new(),
        );

        assert!(matches!(result, Err(TailerError::IoError(_))));
        assert_eq!(receiver.recv().unwrap().resource_path, "/a");
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_stop_before_start_is_an_error() {
        let mut tailer = FileTailer::new(
            "/nonexistent/access.log",
            Arc::new(CommonLogParser::new()),
            TailerConfig::default(),
        );
        assert!(matches!(tailer.stop(), Err(TailerError::NotRunning(_))));
        assert!(!tailer.is_running());
    }

    #[test]
    fn test_start_on_missing_file_fails_and_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut tailer = FileTailer::new(&path, Arc::new(CommonLogParser::new()), TailerConfig::default());

        assert!(matches!(tailer.start(), Err(TailerError::Open { .. })));

        std::fs::write(&path, "").unwrap();
        assert!(tailer.start().is_ok());
        assert!(tailer.stop().is_ok());
    }

    #[test]
    fn test_double_start_and_double_stop() {
        let temp = NamedTempFile::new().unwrap();
        let mut tailer = FileTailer::new(
            temp.path(),
            Arc::new(CommonLogParser::new()),
            TailerConfig {
                poll_interval: Duration::from_millis(10),
                ..TailerConfig::default()
            },
        );

        assert!(tailer.start().is_ok());
        assert!(tailer.is_running());
        assert!(matches!(tailer.start(), Err(TailerError::AlreadyRunning(_))));

        assert!(tailer.stop().is_ok());
        assert!(matches!(tailer.stop(), Err(TailerError::NotRunning(_))));
        assert!(matches!(tailer.start(), Err(TailerError::Finished(_))));
        assert!(matches!(
            tailer.subscribe(),
            Err(TailerError::Subscribe(_))
        ));
    }

    #[test]
    fn test_tailer_fans_out_new_lines_and_closes_on_stop() {
        let temp = NamedTempFile::new().unwrap();
        append(
            temp.path(),
            "127.0.0.1 - - [09/May/2018:16:00:39 +0000] \"GET /ignored HTTP/1.0\" 200 1\n",
        );
        let mut tailer = FileTailer::new(
            temp.path(),
            Arc::new(CommonLogParser::new()),
            TailerConfig {
                poll_interval: Duration::from_millis(10),
                ..TailerConfig::default()
            },
        );
        let first = tailer.subscribe().unwrap();
        let second = tailer.subscriptions().subscribe().unwrap();
        tailer.start().unwrap();

        append(
            temp.path(),
            "127.0.0.1 - james [09/May/2018:16:00:40 +0000] \"GET /report HTTP/1.0\" 200 123\n\
             127.0.0.1 - jill [09/May/2018:16:00:41 +0000] \"GET /api/user HTTP/1.0\" 200 234\n",
        );

        for receiver in [&first, &second] {
            let a = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
            let b = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(a.resource_path, "/report");
            assert_eq!(b.resource_path, "/api/user");
        }

        tailer.stop().unwrap();
        assert_eq!(
            first.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert_eq!(
            second.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
