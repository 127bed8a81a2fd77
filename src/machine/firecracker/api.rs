//! Firecracker REST API client over the VMM's Unix socket.

use crate::error::{Error, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

use super::DRIVER_NAME;

/// `GET /` response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    /// `Not started`, `Running` or `Paused`.
    pub state: String,
    #[serde(default)]
    pub vmm_version: String,
}

#[derive(Debug, Deserialize)]
struct Fault {
    fault_message: String,
}

/// Client for one VMM.
#[derive(Debug, Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ApiClient {
    /// Client for the API socket at `path`. Each request must complete
    /// within `timeout`.
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Instance state.
    pub async fn describe(&self) -> Result<InstanceInfo> {
        self.get("/").await
    }

    /// `GET` a JSON resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.request::<()>(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// `PUT` a JSON body.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.request(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    /// `PATCH` a JSON body.
    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.request(Method::PATCH, path, Some(body)).await.map(|_| ())
    }

    /// Send an action such as `InstanceStart`.
    pub async fn action(&self, action_type: &str) -> Result<()> {
        self.put("/actions", &serde_json::json!({ "action_type": action_type }))
            .await
    }

    /// Perform one request on a fresh connection.
    ///
    /// Connection failures surface as [`Error::Io`]; error responses carry
    /// the VMM's fault message.
    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes> {
        let operation = format!("{} {}", method, path);
        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let io = TokioIo::new(stream);

            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| Error::driver(DRIVER_NAME, &operation, e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "api connection closed with error");
                }
            });

            let builder = Request::builder()
                .method(method.clone())
                .uri(format!("http://localhost{}", path))
                .header("Host", "localhost")
                .header("Accept", "application/json");
            let request = match body {
                Some(body) => {
                    let bytes = serde_json::to_vec(body)?;
                    builder
                        .header("Content-Type", "application/json")
                        .header("Content-Length", bytes.len())
                        .body(Full::new(Bytes::from(bytes)))
                }
                None => builder.body(Full::new(Bytes::new())),
            }
            .map_err(|e| Error::driver(DRIVER_NAME, &operation, e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| Error::driver(DRIVER_NAME, &operation, e.to_string()))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::driver(DRIVER_NAME, &operation, e.to_string()))?
                .to_bytes();

            if !status.is_success() {
                let reason = serde_json::from_slice::<Fault>(&body)
                    .map(|f| f.fault_message)
                    .unwrap_or_else(|_| format!("status {}", status));
                return Err(Error::driver(DRIVER_NAME, &operation, reason));
            }
            Ok::<Bytes, Error>(body)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("firecracker {}", operation),
                duration: self.timeout,
            })?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-in for the VMM API.

    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// A fake VMM that tracks the instance state driven by actions.
    pub struct FakeApi {
        /// `"METHOD path body"` for every request, in order.
        pub requests: Arc<Mutex<Vec<String>>>,
        /// Current `GET /` state.
        pub state: Arc<Mutex<String>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl FakeApi {
        /// Requests received so far.
        pub fn seen(&self) -> Vec<String> {
            self.requests.lock().clone()
        }

        /// Stop serving.
        pub async fn shutdown(self) {
            self.handle.abort();
            let _ = self.handle.await;
        }
    }

    /// Serve one request per connection on `path`.
    pub fn serve(path: &Path) -> FakeApi {
        let listener = UnixListener::bind(path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new("Not started".to_string()));
        let (log, current) = (requests.clone(), state.clone());

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                    continue;
                }
                let mut length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).await.unwrap();
                    let header = header.trim();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).await.unwrap();
                let body = String::from_utf8(body).unwrap();

                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();
                log.lock().push(format!("{} {} {}", method, path, body).trim().to_string());

                let response = match (method.as_str(), path.as_str()) {
                    ("GET", "/") => {
                        let payload = serde_json::json!({
                            "id": "fake",
                            "state": current.lock().clone(),
                            "vmm_version": "1.0.0",
                        })
                        .to_string();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            payload.len(),
                            payload
                        )
                    }
                    ("PUT", "/actions") if body.contains("InstanceStart") => {
                        *current.lock() = "Running".to_string();
                        "HTTP/1.1 204 No Content\r\n\r\n".to_string()
                    }
                    ("PATCH", "/vm") => {
                        *current.lock() = if body.contains("Resumed") {
                            "Running".to_string()
                        } else {
                            "Paused".to_string()
                        };
                        "HTTP/1.1 204 No Content\r\n\r\n".to_string()
                    }
                    ("PUT", "/broken") => {
                        let payload = r#"{"fault_message": "bad request"}"#;
                        format!(
                            "HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            payload.len(),
                            payload
                        )
                    }
                    _ => "HTTP/1.1 204 No Content\r\n\r\n".to_string(),
                };
                let _ = write.write_all(response.as_bytes()).await;
                let _ = write.shutdown().await;
            }
        });

        FakeApi {
            requests,
            state,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_describe_and_actions() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("api.sock");
        let fake = testing::serve(&sock);
        let client = ApiClient::new(&sock, Duration::from_secs(5));

        assert_eq!(client.describe().await.unwrap().state, "Not started");
        client.action("InstanceStart").await.unwrap();
        assert_eq!(client.describe().await.unwrap().state, "Running");

        let seen = fake.seen();
        assert_eq!(seen[0], "GET /");
        assert_eq!(seen[1], r#"PUT /actions {"action_type":"InstanceStart"}"#);
    }

    #[tokio::test]
    async fn test_fault_message_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("api.sock");
        let _fake = testing::serve(&sock);
        let client = ApiClient::new(&sock, Duration::from_secs(5));

        let err = client
            .put("/broken", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "firecracker PUT /broken failed: bad request");
    }

    #[tokio::test]
    async fn test_missing_socket_is_io_error() {
        let dir = TempDir::new().unwrap();
        let client = ApiClient::new(dir.path().join("absent.sock"), Duration::from_secs(1));
        let err = client.describe().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
