//! Console log tailing.
//!
//! [`LogTail`] reads complete lines from a growing file and remembers how
//! far it got; [`follow`] wraps it in a task that drains the backlog and
//! then wakes on filesystem notifications instead of polling. The
//! notifications come from the parent directory, so a follower survives
//! the log being rotated away and recreated.

use crate::error::{Error, Result};
use crate::watch::{subscription, Publisher, Subscription};
use notify::event::ModifyKind;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Incremental line reader over a log file.
#[derive(Debug, Clone)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    inode: Option<u64>,
}

impl LogTail {
    /// Start reading `path` from the beginning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            inode: None,
        }
    }

    /// Path being tailed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the first unread line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line written since the last call.
    ///
    /// A trailing partial line is left unread and picked up whole on a
    /// later call. Leading NUL padding is stripped; lines made only of
    /// padding are dropped. If the file shrank below the offset it was
    /// truncated, and if the path now names another file it was rotated;
    /// either way reading restarts from the top.
    pub fn read_available(&mut self) -> io::Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let replaced = self.inode.is_some_and(|ino| ino != meta.ino());
        if replaced || meta.len() < self.offset {
            self.offset = 0;
        }
        self.inode = Some(meta.ino());
        file.seek(SeekFrom::Start(self.offset))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = buf[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buf[consumed..consumed + pos];
            consumed += pos + 1;

            let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
            if start > 0 && start == raw.len() {
                continue;
            }
            let line = String::from_utf8_lossy(&raw[start..]);
            lines.push(line.trim_end_matches('\r').to_string());
        }

        self.offset += consumed as u64;
        Ok(lines)
    }
}

/// Stream the lines of a log file.
///
/// The backlog is drained first. With `keep_following` the stream then
/// emits new lines as they are written until cancelled, and ends with
/// [`Error::EndOfStream`] if the file is removed; otherwise it ends with
/// [`Error::EndOfStream`] right after the backlog.
pub fn follow(
    path: impl Into<PathBuf>,
    keep_following: bool,
    cancel: CancellationToken,
) -> Result<Subscription<String>> {
    let path = path.into().canonicalize()?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::invalid_config(format!("{} has no parent", path.display())))?;

    let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
    let watcher = if keep_following {
        // The watcher is armed before the backlog is read so that no write
        // can fall between the two.
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        Some(watcher)
    } else {
        None
    };

    let (publisher, sub) = subscription(cancel);
    tokio::spawn(run(LogTail::new(path), watcher, notify_rx, publisher));
    Ok(sub)
}

async fn run(
    mut tail: LogTail,
    watcher: Option<RecommendedWatcher>,
    mut events: mpsc::Receiver<notify::Result<notify::Event>>,
    publisher: Publisher<String>,
) {
    if !drain(&mut tail, &publisher).await {
        return;
    }
    let Some(_watcher) = watcher else {
        let _ = publisher.fail(Error::EndOfStream).await;
        return;
    };

    tracing::debug!(path = %tail.path().display(), "following log");

    loop {
        tokio::select! {
            _ = publisher.token().cancelled() => {
                tracing::debug!(path = %tail.path().display(), "log follower cancelled");
                return;
            }
            _ = publisher.closed() => return,
            event = events.recv() => match event {
                Some(Ok(event)) if !event.paths.iter().any(|p| p == tail.path()) => {}
                Some(Ok(event)) if event.kind.is_remove() => {
                    let _ = drain(&mut tail, &publisher).await;
                    let _ = publisher.fail(Error::EndOfStream).await;
                    return;
                }
                Some(Ok(event))
                    if matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)))
                        && !tail.path().exists() =>
                {
                    // Rotated away; the next create brings the new file.
                    tracing::debug!(path = %tail.path().display(), "log rotated");
                }
                Some(Ok(_)) => {
                    if !drain(&mut tail, &publisher).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(path = %tail.path().display(), error = %e, "log watcher error");
                }
                None => return,
            }
        }
    }
}

/// Emit everything readable. Returns false once the stream has ended.
async fn drain(tail: &mut LogTail, publisher: &Publisher<String>) -> bool {
    match tail.read_available() {
        Ok(lines) => {
            for line in lines {
                if !publisher.send(line).await {
                    return false;
                }
            }
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let _ = publisher.fail(Error::EndOfStream).await;
            false
        }
        Err(e) => {
            let _ = publisher.fail(e.into()).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn append(path: &Path, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data).unwrap();
        f.sync_all().unwrap();
    }

    async fn next_line(sub: &mut Subscription<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .expect("timed out waiting for line")
            .expect("stream closed")
    }

    #[test]
    fn test_partial_line_is_held_back() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"first\nsec");

        let mut tail = LogTail::new(&log);
        assert_eq!(tail.read_available().unwrap(), vec!["first"]);
        assert_eq!(tail.offset(), 6);
        assert!(tail.read_available().unwrap().is_empty());

        append(&log, b"ond\nthird\n");
        assert_eq!(tail.read_available().unwrap(), vec!["second", "third"]);
        assert!(tail.read_available().unwrap().is_empty());
    }

    #[test]
    fn test_nul_padding_is_stripped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"\0\0\0\0boot\n\0\0\n\r\nok\r\n");

        let mut tail = LogTail::new(&log);
        assert_eq!(tail.read_available().unwrap(), vec!["boot", "", "ok"]);
    }

    #[test]
    fn test_truncated_file_restarts() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"one\ntwo\n");

        let mut tail = LogTail::new(&log);
        assert_eq!(tail.read_available().unwrap().len(), 2);

        std::fs::write(&log, b"new\n").unwrap();
        assert_eq!(tail.read_available().unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_follow_backlog_then_new_writes_in_order() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"line 1\nline 2\n");

        let mut sub = follow(&log, true, CancellationToken::new()).unwrap();
        assert_eq!(next_line(&mut sub).await, "line 1");
        assert_eq!(next_line(&mut sub).await, "line 2");

        // One line split across two writes.
        append(&log, b"line 3\nli");
        assert_eq!(next_line(&mut sub).await, "line 3");
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&log, b"ne 4\n");
        assert_eq!(next_line(&mut sub).await, "line 4");

        // Nothing duplicated.
        let extra = tokio::time::timeout(Duration::from_millis(200), sub.events.recv()).await;
        assert!(extra.is_err(), "unexpected extra line: {:?}", extra);
    }

    #[tokio::test]
    async fn test_follow_survives_rotation() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"old 1\n");

        let mut sub = follow(&log, true, CancellationToken::new()).unwrap();
        assert_eq!(next_line(&mut sub).await, "old 1");

        std::fs::rename(&log, dir.path().join("machine.log.1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&log, b"new 1\n");
        assert_eq!(next_line(&mut sub).await, "new 1");

        append(&log, b"new 2\n");
        assert_eq!(next_line(&mut sub).await, "new 2");
    }

    #[test]
    fn test_replaced_file_restarts() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"a much longer first line\n");

        let mut tail = LogTail::new(&log);
        assert_eq!(tail.read_available().unwrap().len(), 1);

        std::fs::rename(&log, dir.path().join("machine.log.1")).unwrap();
        append(&log, b"0123456789abcdefghijklmnopqrstuvwxyz\n");
        assert_eq!(
            tail.read_available().unwrap(),
            vec!["0123456789abcdefghijklmnopqrstuvwxyz"]
        );
    }

    #[tokio::test]
    async fn test_follow_without_keep_following_ends_after_backlog() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"a\nb\n");

        let mut sub = follow(&log, false, CancellationToken::new()).unwrap();
        assert_eq!(next_line(&mut sub).await, "a");
        assert_eq!(next_line(&mut sub).await, "b");
        let err = tokio::time::timeout(Duration::from_secs(5), sub.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::EndOfStream));
    }

    #[tokio::test]
    async fn test_follow_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("machine.log");
        append(&log, b"a\n");

        let cancel = CancellationToken::new();
        let mut sub = follow(&log, true, cancel.clone()).unwrap();
        assert_eq!(next_line(&mut sub).await, "a");

        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_follow_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = follow(dir.path().join("absent.log"), true, CancellationToken::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
