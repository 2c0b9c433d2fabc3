//! Shared fixtures for integration tests.
//!
//! - [`StubServer`]: minimal HTTP/1.1 server on `127.0.0.1:0` serving canned responses
//! - [`write_script`]: executable `/bin/sh` stand-in for the scanner (unix only)

#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct StubResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Send the body in chunks of this size with a pause after each one
    pub throttle: Option<(usize, Duration)>,
}

impl StubResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            throttle: None,
        }
    }

    /// A 200 response whose body trickles out slowly.
    pub fn slow(body: impl Into<Vec<u8>>, chunk_size: usize, pause: Duration) -> Self {
        Self {
            throttle: Some((chunk_size, pause)),
            ..Self::ok(body)
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            throttle: None,
        }
    }
}

#[derive(Default)]
struct Routes {
    /// Responses per path; the last one repeats once the others are used up
    responses: HashMap<String, VecDeque<StubResponse>>,
    hits: HashMap<String, usize>,
}

impl Routes {
    fn respond(&mut self, path: &str) -> StubResponse {
        *self.hits.entry(path.to_string()).or_default() += 1;
        match self.responses.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| StubResponse::status(404)),
            None => StubResponse::status(404),
        }
    }
}

/// In-process HTTP server answering GET requests from canned routes.
pub struct StubServer {
    addr: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(Mutex::new(Routes::default()));

        let shared = routes.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, routes, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn route(&self, path: &str, response: StubResponse) {
        self.route_sequence(path, vec![response]);
    }

    pub fn route_sequence(&self, path: &str, responses: Vec<StubResponse>) {
        self.routes
            .lock()
            .unwrap()
            .responses
            .insert(path.to_string(), responses.into());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.routes.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, routes: Arc<Mutex<Routes>>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let head = String::from_utf8_lossy(&request);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let response = routes.lock().unwrap().respond(&path);
    let reason = match response.status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        response.status,
        reason,
        response.body.len()
    );

    let _ = stream.write_all(header.as_bytes()).await;
    match response.throttle {
        Some((chunk_size, pause)) => {
            for chunk in response.body.chunks(chunk_size.max(1)) {
                if stream.write_all(chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(pause).await;
            }
        }
        None => {
            let _ = stream.write_all(&response.body).await;
        }
    }
    let _ = stream.shutdown().await;
}

/// HTTP client that never goes through a proxy, so loopback requests stay local.
pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// A temp dir with a UTF-8 path.
pub fn utf8_temp_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, path)
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Utf8Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
