//! Resolving a user-supplied target to one live kernel.
//!
//! A target is one of:
//!
//! 1. a connection file path (`*.json`, or any existing file), read directly;
//! 2. a kernel id, or a unique prefix of one, matched against
//!    `kernel-<id>*.json` in the Jupyter runtime directory;
//! 3. a notebook path (`*.ipynb`), looked up in the sessions of every
//!    Jupyter server advertised in the runtime directory
//!    (`jpserver-*.json`, `nbserver-*.json`). Matching sessions yield kernel
//!    ids, which are then resolved as in (2).
//!
//! Every candidate is probed once for liveness. Exactly one live kernel must
//! remain; several are reported as ambiguous rather than picked between.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::fs;

use crate::connection::ConnectionDescriptor;
use crate::error::LocatorError;
use crate::heartbeat;

/// Timeout for each Jupyter server sessions query.
const SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// What the user asked to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelTarget {
    ConnectionFile(PathBuf),
    KernelId(String),
    Notebook(PathBuf),
}

impl KernelTarget {
    pub fn parse(target: &str) -> Self {
        let path = Path::new(target);
        match path.extension().and_then(|e| e.to_str()) {
            Some("ipynb") => KernelTarget::Notebook(path.to_path_buf()),
            Some("json") => KernelTarget::ConnectionFile(path.to_path_buf()),
            _ if path.is_file() => KernelTarget::ConnectionFile(path.to_path_buf()),
            _ => KernelTarget::KernelId(target.trim_start_matches("kernel-").to_string()),
        }
    }
}

impl fmt::Display for KernelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelTarget::ConnectionFile(path) => write!(f, "{}", path.display()),
            KernelTarget::KernelId(id) => write!(f, "kernel {}", id),
            KernelTarget::Notebook(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A resolved, live kernel.
#[derive(Debug, Clone)]
pub struct Located {
    pub descriptor: ConnectionDescriptor,
    pub connection_file: PathBuf,
}

/// Liveness check applied to every candidate.
pub trait KernelProbe: Sync {
    fn is_alive(&self, descriptor: &ConnectionDescriptor) -> impl Future<Output = bool> + Send;
}

/// Probes a candidate with a single heartbeat round trip.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatKernelProbe {
    pub timeout: Duration,
}

impl KernelProbe for HeartbeatKernelProbe {
    async fn is_alive(&self, descriptor: &ConnectionDescriptor) -> bool {
        heartbeat::check_kernel_alive(descriptor, self.timeout).await
    }
}

/// Server entry as written to `jpserver-<pid>.json` / `nbserver-<pid>.json`.
#[derive(Debug, Deserialize)]
struct ServerInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    root_dir: Option<String>,
    #[serde(default)]
    notebook_dir: Option<String>,
}

impl ServerInfo {
    fn root_dir(&self) -> &str {
        self.root_dir
            .as_deref()
            .or(self.notebook_dir.as_deref())
            .unwrap_or("")
    }
}

/// One entry of `GET /api/sessions`.
#[derive(Debug, Deserialize)]
struct ServerSession {
    #[serde(default)]
    path: Option<String>,
    /// Older notebook servers nest the path here.
    #[serde(default)]
    notebook: Option<NotebookRef>,
    #[serde(default)]
    kernel: Option<KernelRef>,
}

#[derive(Debug, Deserialize)]
struct NotebookRef {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KernelRef {
    id: String,
}

impl ServerSession {
    fn path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .or_else(|| self.notebook.as_ref().and_then(|n| n.path.as_deref()))
    }
}

/// Lexically normalize a path: drop `.` and resolve `..` without touching
/// the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize(&cwd.join(path))
    }
}

fn same_notebook(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Kernel ids of the server sessions whose notebook is `notebook`
/// (absolute, normalized).
fn kernel_ids_for_notebook(
    root_dir: &str,
    sessions: &[ServerSession],
    notebook: &Path,
) -> Vec<String> {
    sessions
        .iter()
        .filter_map(|session| {
            let kernel = session.kernel.as_ref()?;
            let path = session.path()?;
            let session_path = absolute(&Path::new(root_dir).join(path));
            same_notebook(&session_path, notebook).then(|| kernel.id.clone())
        })
        .collect()
}

/// Finds kernels under one runtime directory.
pub struct Locator {
    runtime_dir: PathBuf,
    server_timeout: Duration,
}

impl Default for Locator {
    fn default() -> Self {
        Self::new(runtimelib::runtime_dir())
    }
}

impl Locator {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self {
            runtime_dir,
            server_timeout: SERVER_TIMEOUT,
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Resolve `target` to exactly one live kernel.
    pub async fn locate<P: KernelProbe>(
        &self,
        target: &KernelTarget,
        probe: &P,
    ) -> Result<Located, LocatorError> {
        let candidates = match target {
            KernelTarget::ConnectionFile(path) => {
                if !path.exists() {
                    return Err(LocatorError::NotFound {
                        target: target.to_string(),
                    });
                }
                vec![path.clone()]
            }
            KernelTarget::KernelId(id) => self.connection_files_for(id).await,
            KernelTarget::Notebook(path) => {
                let mut files = BTreeSet::new();
                for id in self.kernel_ids_for(path).await {
                    files.extend(self.connection_files_for(&id).await);
                }
                files.into_iter().collect()
            }
        };
        debug!(
            "[locator] {} candidate(s) for {}: {:?}",
            candidates.len(),
            target,
            candidates
        );

        let single = candidates.len() == 1;
        let mut live: Vec<Located> = Vec::new();
        for path in candidates {
            let descriptor = match ConnectionDescriptor::read(&path) {
                Ok(d) => d,
                Err(e) if single => return Err(e),
                Err(e) => {
                    warn!("[locator] Skipping {}", e);
                    continue;
                }
            };
            if !probe.is_alive(&descriptor).await {
                info!("[locator] Kernel at {} is not responding", path.display());
                continue;
            }
            if live.iter().any(|l| l.descriptor == descriptor) {
                continue;
            }
            live.push(Located {
                descriptor,
                connection_file: path,
            });
        }

        match live.len() {
            0 => Err(LocatorError::NotFound {
                target: target.to_string(),
            }),
            1 => Ok(live.remove(0)),
            _ => Err(LocatorError::Ambiguous {
                target: target.to_string(),
                candidates: live
                    .iter()
                    .map(|l| l.connection_file.display().to_string())
                    .collect(),
            }),
        }
    }

    /// `kernel-<id>*.json` files in the runtime directory, sorted.
    async fn connection_files_for(&self, id: &str) -> Vec<PathBuf> {
        if id.is_empty() {
            return Vec::new();
        }
        let prefix = format!("kernel-{}", id);
        let mut files: Vec<PathBuf> = self
            .runtime_files(|name| name.starts_with(&prefix))
            .await;
        files.sort();
        files
    }

    async fn runtime_files(&self, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.runtime_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "[locator] Cannot read runtime dir {}: {}",
                    self.runtime_dir.display(),
                    e
                );
                return files;
            }
        };
        while let Some(entry) = entries.next_entry().await.ok().flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if keep(file_name) {
                files.push(path);
            }
        }
        files
    }

    /// Ask every advertised Jupyter server which kernel runs `notebook`.
    async fn kernel_ids_for(&self, notebook: &Path) -> Vec<String> {
        let notebook = absolute(notebook);
        let mut servers = self
            .runtime_files(|name| name.starts_with("jpserver-") || name.starts_with("nbserver-"))
            .await;
        servers.sort();

        let client = match reqwest::Client::builder()
            .timeout(self.server_timeout)
            .no_proxy()
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("[locator] Cannot create HTTP client: {}", e);
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for server_file in servers {
            match self.query_server(&client, &server_file, &notebook).await {
                Ok(found) => {
                    for id in found {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                Err(e) => debug!("[locator] Skipping {}: {}", server_file.display(), e),
            }
        }
        ids
    }

    async fn query_server(
        &self,
        client: &reqwest::Client,
        server_file: &Path,
        notebook: &Path,
    ) -> Result<Vec<String>, String> {
        let content = fs::read_to_string(server_file)
            .await
            .map_err(|e| e.to_string())?;
        let server: ServerInfo = serde_json::from_str(&content).map_err(|e| e.to_string())?;
        if server.url.is_empty() {
            return Err("no url".to_string());
        }

        let url = format!("{}/api/sessions", server.url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .header("Authorization", format!("token {}", server.token))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("{} returned {}", url, response.status()));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        let sessions: Vec<ServerSession> =
            serde_json::from_str(&body).map_err(|e| e.to_string())?;

        let ids = kernel_ids_for_notebook(server.root_dir(), &sessions, notebook);
        for id in &ids {
            info!("[locator] {} has kernel {}", server.url, id);
        }
        Ok(ids)
    }
}
