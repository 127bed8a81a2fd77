//! Minimal QMP (QEMU Machine Protocol) client.
//!
//! QMP is line-delimited JSON over a Unix socket. After connecting, the
//! server sends a greeting and accepts commands once capabilities have
//! been negotiated. Asynchronous events can arrive between a command and
//! its reply; [`QmpClient::execute`] skips them.

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// An asynchronous event pushed by the emulator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QmpEvent {
    /// Event name, e.g. `SHUTDOWN`.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// A negotiated QMP connection.
#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl QmpClient {
    /// Connect and negotiate capabilities within `timeout`.
    ///
    /// Connection failures surface as [`Error::Io`] so callers can tell a
    /// vanished socket from a protocol error.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let handshake = async {
            let stream = UnixStream::connect(path).await?;
            let (read, writer) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(read),
                writer,
                line: String::new(),
            };

            let greeting = client.read_message().await?;
            if greeting.get("QMP").is_none() {
                return Err(Error::driver("qemu", "connect", "missing qmp greeting"));
            }
            client.execute("qmp_capabilities").await?;
            Ok::<Self, Error>(client)
        };

        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("qmp handshake on {}", path.display()),
                duration: timeout,
            })?
    }

    async fn read_message(&mut self) -> Result<Value> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "qmp connection closed",
                )));
            }
            let trimmed = self.line.trim();
            if !trimmed.is_empty() {
                return Ok(serde_json::from_str(trimmed)?);
            }
        }
    }

    /// Run a command without arguments and return its `return` payload.
    pub async fn execute(&mut self, command: &str) -> Result<Value> {
        self.execute_with(command, None).await
    }

    /// Run a command with optional arguments.
    pub async fn execute_with(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut request = json!({ "execute": command });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        let mut bytes = serde_json::to_vec(&request)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;

        loop {
            let msg = self.read_message().await?;
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = msg.get("error") {
                let desc = err
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::driver("qemu", command, desc));
            }
            // An event raced the reply.
            tracing::trace!(message = %msg, "skipping qmp message while awaiting reply");
        }
    }

    /// Native run state, e.g. `running` or `paused`.
    pub async fn query_status(&mut self) -> Result<String> {
        let ret = self.execute("query-status").await?;
        ret.get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::driver("qemu", "query-status", "reply has no status"))
    }

    /// Wait for the next event. `None` once the emulator closed the socket.
    pub async fn next_event(&mut self) -> Result<Option<QmpEvent>> {
        loop {
            match self.read_message().await {
                Ok(msg) if msg.get("event").is_some() => {
                    return Ok(Some(serde_json::from_value(msg)?));
                }
                Ok(_) => continue,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether a connect error means the control socket is gone.
pub fn is_gone(err: &Error) -> bool {
    match err {
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted QMP server for tests.

    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// A fake emulator socket answering commands by name.
    pub struct FakeQmp {
        /// Every command received, across connections.
        pub commands: Arc<Mutex<Vec<String>>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl FakeQmp {
        /// Stop serving and drop any open connection.
        pub async fn shutdown(self) {
            self.handle.abort();
            let _ = self.handle.await;
        }

        /// Commands received so far.
        pub fn seen(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    /// Serve connections one after another: greet, then answer each
    /// command by name (`{"return": {}}` by default). `events` are pushed
    /// right after capabilities are negotiated.
    pub fn serve(path: &Path, replies: Vec<(&'static str, String)>, events: Vec<String>) -> FakeQmp {
        let listener = UnixListener::bind(path).unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = commands.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();

                if write
                    .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\r\n")
                    .await
                    .is_err()
                {
                    continue;
                }

                while let Ok(Some(line)) = lines.next_line().await {
                    let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                    let cmd = req["execute"].as_str().unwrap().to_string();
                    log.lock().push(cmd.clone());

                    let reply = replies
                        .iter()
                        .find(|(name, _)| *name == cmd)
                        .map(|(_, r)| r.clone())
                        .unwrap_or_else(|| "{\"return\": {}}".to_string());
                    let mut out = reply.into_bytes();
                    out.extend_from_slice(b"\r\n");
                    if cmd == "qmp_capabilities" {
                        for event in &events {
                            out.extend_from_slice(event.as_bytes());
                            out.extend_from_slice(b"\r\n");
                        }
                    }
                    if write.write_all(&out).await.is_err() {
                        break;
                    }
                }
            }
        });
        FakeQmp { commands, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_query_status() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("qmp.sock");
        let server = testing::serve(
            &sock,
            vec![(
                "query-status",
                r#"{"return": {"status": "paused", "running": false}}"#.to_string(),
            )],
            vec![],
        );

        let mut client = QmpClient::connect(&sock, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.query_status().await.unwrap(), "paused");
        assert_eq!(server.seen(), vec!["qmp_capabilities", "query-status"]);
    }

    #[tokio::test]
    async fn test_error_reply_names_command() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("qmp.sock");
        let _server = testing::serve(
            &sock,
            vec![(
                "cont",
                r#"{"error": {"class": "GenericError", "desc": "guest is dead"}}"#.to_string(),
            )],
            vec![],
        );

        let mut client = QmpClient::connect(&sock, Duration::from_secs(5)).await.unwrap();
        let err = client.execute("cont").await.unwrap_err();
        assert_eq!(err.to_string(), "qemu cont failed: guest is dead");
    }

    #[tokio::test]
    async fn test_events_are_skipped_while_awaiting_reply() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("qmp.sock");
        let _server = testing::serve(
            &sock,
            vec![(
                "query-status",
                r#"{"return": {"status": "running"}}"#.to_string(),
            )],
            vec![r#"{"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 0}}"#.to_string()],
        );

        let mut client = QmpClient::connect(&sock, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.query_status().await.unwrap(), "running");
    }

    #[tokio::test]
    async fn test_next_event_and_eof() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("qmp.sock");
        let server = testing::serve(
            &sock,
            vec![],
            vec![r#"{"event": "SHUTDOWN", "data": {"guest": true}}"#.to_string()],
        );

        let mut client = QmpClient::connect(&sock, Duration::from_secs(5)).await.unwrap();
        let event = client.next_event().await.unwrap().unwrap();
        assert_eq!(event.event, "SHUTDOWN");
        assert_eq!(event.data["guest"], true);

        server.shutdown().await;
        assert!(client.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_gone() {
        let dir = TempDir::new().unwrap();
        let err = QmpClient::connect(&dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(is_gone(&err));
    }
}
