#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nido::catalog::CatalogFetcher;
use nido::config::EngineConfig;
use nido::error::NidoError;
use nido::hypervisor::{Hypervisor, LaunchSpec};
use nido::platform::{HostPlatform, Linux};
use nido::process::{ProcessTable, Signal};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── engine config ────────────────────────────────────────

/// Defaults rooted in `root`, with boot keys that give up almost at once.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_root(root);
    config.key_injection.settle = Duration::from_millis(10);
    config.key_injection.interval = Duration::from_millis(10);
    config.key_injection.deadline = Duration::from_secs(1);
    config.catalog_url = "https://catalog.invalid/catalog.json".into();
    config
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}

// ── fake process table ───────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeProcesses {
    pub alive: Arc<Mutex<HashSet<u32>>>,
    pub signals: Arc<Mutex<Vec<(u32, Signal)>>>,
}

impl FakeProcesses {
    /// Simulate the process dying on its own.
    pub fn kill_externally(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessTable for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        if self.alive.lock().unwrap().remove(&pid) {
            Ok(())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such process"))
        }
    }
}

// ── fake hypervisor ──────────────────────────────────────

/// Writes marker files instead of running qemu-img, and "launches" by adding
/// a pid to the shared fake process table.
pub struct FakeHypervisor {
    platform: Linux,
    processes: FakeProcesses,
    next_pid: AtomicU32,
    pub launches: Arc<Mutex<Vec<LaunchSpec>>>,
    pub fail_launch: AtomicBool,
}

impl FakeHypervisor {
    pub fn new(processes: FakeProcesses) -> Self {
        Self {
            platform: Linux { kvm: false },
            processes,
            next_pid: AtomicU32::new(40_000),
            launches: Arc::new(Mutex::new(Vec::new())),
            fail_launch: AtomicBool::new(false),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

async fn write_marker(dest: &Path, contents: String) -> Result<(), NidoError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(dest, contents).await.map_err(|e| NidoError::DiskCreation {
        path: dest.display().to_string(),
        message: e.to_string(),
    })
}

impl Hypervisor for FakeHypervisor {
    fn platform(&self) -> &dyn HostPlatform {
        &self.platform
    }

    async fn create_overlay(&self, base: &Path, dest: &Path) -> Result<(), NidoError> {
        write_marker(dest, format!("overlay of {}", base.display())).await
    }

    async fn create_blank(&self, dest: &Path, size_bytes: u64) -> Result<(), NidoError> {
        write_marker(dest, format!("blank {size_bytes}")).await
    }

    async fn compact(&self, src: &Path, dest: &Path) -> Result<(), NidoError> {
        let contents = tokio::fs::read_to_string(src).await.unwrap();
        write_marker(dest, format!("compacted {contents}")).await
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<u32, NidoError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(NidoError::Launch {
                vm: spec.name.clone(),
                message: "qemu-system-x86_64: could not set up host forwarding rule".into(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(spec.pidfile.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&spec.pidfile, pid.to_string()).await.unwrap();
        self.processes.alive.lock().unwrap().insert(pid);
        self.launches.lock().unwrap().push(spec.clone());
        Ok(pid)
    }

    fn required_binaries(&self) -> Vec<String> {
        vec!["sh".into()]
    }
}

// ── fake catalog source ──────────────────────────────────

/// Serves a fixed catalog body and counts requests. `None` simulates an
/// unreachable catalog host.
#[derive(Default)]
pub struct CountingFetcher {
    pub body: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn serving(body: impl Into<String>) -> Self {
        Self {
            body: Mutex::new(Some(body.into())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn go_offline(&self) {
        *self.body.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CatalogFetcher for CountingFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, NidoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.body
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| NidoError::Download {
                message: "connection refused".into(),
                source: None,
            })
    }
}

/// One-image catalog with `alpine` `3.20` aliased `latest`.
pub fn alpine_catalog(url: &str, image: &[u8]) -> String {
    format!(
        r#"{{
  "schema_version": "1",
  "updated_at": "2026-10-01T00:00:00Z",
  "images": [
    {{
      "name": "alpine",
      "registry": "official",
      "description": "Alpine Linux",
      "homepage": "https://alpinelinux.org",
      "versions": [
        {{
          "version": "3.20",
          "aliases": ["latest"],
          "arch": "x86_64",
          "url": "{url}",
          "checksum_type": "sha256",
          "checksum": "{checksum}",
          "size_bytes": {size},
          "format": "qcow2"
        }}
      ]
    }}
  ]
}}"#,
        checksum = sha256_hex(image),
        size = image.len(),
    )
}

// ── HTTP server ──────────────────────────────────────────

pub struct Route {
    body: Vec<u8>,
    honor_range: bool,
    /// Answer ranged requests with 206 from byte 0.
    misaligned: bool,
    /// Drop the connection after this many body bytes, once.
    cut_after: Option<usize>,
    cut_done: AtomicBool,
}

impl Route {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            honor_range: true,
            misaligned: false,
            cut_after: None,
            cut_done: AtomicBool::new(false),
        }
    }

    pub fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    pub fn resuming_from_zero(mut self) -> Self {
        self.misaligned = true;
        self
    }

    pub fn cut_first_after(mut self, bytes: usize) -> Self {
        self.cut_after = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub path: String,
    pub range_start: Option<u64>,
}

/// Minimal HTTP/1.1 file server: GET only, one request per connection,
/// `Range: bytes=N-` answered with 206 or 416.
pub struct TestServer {
    base: String,
    hits: Arc<Mutex<Vec<Hit>>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let hits = hits.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(serve(stream, routes.clone(), hits.clone()));
                }
            })
        };

        Self { base, hits, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, routes: Arc<HashMap<String, Route>>, hits: Arc<Mutex<Vec<Hit>>>) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let range_start = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, v)| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<u64>().ok());
    hits.lock().unwrap().push(Hit {
        path: path.clone(),
        range_start,
    });

    let Some(route) = routes.get(&path) else {
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
        return;
    };

    let len = route.body.len() as u64;
    let (status, start, content_range) = match range_start {
        Some(start) if route.honor_range && start >= len => {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{len}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes()).await;
            return;
        }
        Some(start) if route.honor_range => {
            let start = if route.misaligned { 0 } else { start };
            (
                "206 Partial Content",
                start,
                format!("Content-Range: bytes {start}-{}/{len}\r\n", len - 1),
            )
        }
        _ => ("200 OK", 0, String::new()),
    };

    let body = &route.body[start as usize..];
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{content_range}Connection: close\r\n\r\n",
        body.len()
    );
    if stream.write_all(header.as_bytes()).await.is_err() {
        return;
    }

    let body = match route.cut_after {
        Some(cut) if !route.cut_done.swap(true, Ordering::SeqCst) => &body[..cut.min(body.len())],
        _ => body,
    };
    let _ = stream.write_all(body).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// Path of `dest`'s partial download.
pub fn part_of(dest: &Path) -> PathBuf {
    nido::download::part_path(dest)
}
