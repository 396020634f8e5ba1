//! Client for the Cloud Hypervisor REST API on a per-VM unix socket.

use crate::config::VmConfig;
use crate::error::{Result, VmmError};
use crate::state::VmState;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on a single API request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Subset of the `vm.info` response the driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub state: VmState,
    /// Bytes of guest memory currently backing the VM.
    pub memory_actual_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawVmInfo {
    state: String,
    #[serde(default)]
    memory_actual_size: Option<u64>,
    // Older VMM releases nest the figure under `memory`.
    #[serde(default)]
    memory: Option<RawMemoryInfo>,
}

#[derive(Debug, Deserialize)]
struct RawMemoryInfo {
    #[serde(default)]
    actual_size: Option<u64>,
}

impl From<RawVmInfo> for VmInfo {
    fn from(raw: RawVmInfo) -> Self {
        Self {
            state: VmState::from_vmm(&raw.state),
            memory_actual_size: raw
                .memory_actual_size
                .or_else(|| raw.memory.and_then(|m| m.actual_size)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmmPing {
    #[serde(default)]
    pub version: String,
}

/// A client bound to one VM's API socket.
#[derive(Debug, Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send the creation payload (`PUT /api/v1/vm.create`).
    pub async fn create(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_string(config)?;
        self.request(Method::PUT, "vm.create", Some(body)).await?;
        Ok(())
    }

    /// Boot a created VM (`PUT /api/v1/vm.boot`).
    pub async fn boot(&self) -> Result<()> {
        self.request(Method::PUT, "vm.boot", None).await?;
        Ok(())
    }

    /// Create then boot. The VM is left created if boot fails.
    pub async fn create_and_boot(&self, config: &VmConfig) -> Result<()> {
        self.create(config).await?;
        self.boot().await
    }

    pub async fn info(&self) -> Result<VmInfo> {
        let bytes = self.request(Method::GET, "vm.info", None).await?;
        let raw: RawVmInfo = serde_json::from_slice(&bytes)?;
        Ok(raw.into())
    }

    /// Ask the guest to shut down (`PUT /api/v1/vm.shutdown`).
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Method::PUT, "vm.shutdown", None).await?;
        Ok(())
    }

    /// Ask the VMM process itself to exit.
    pub async fn shutdown_vmm(&self) -> Result<()> {
        self.request(Method::PUT, "vmm.shutdown", None).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<VmmPing> {
        let bytes = self.request(Method::GET, "vmm.ping", None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<Bytes> {
        match tokio::time::timeout(self.timeout, self.send(method, endpoint, body)).await {
            Ok(result) => result,
            Err(_) => Err(VmmError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn send(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<Bytes> {
        tracing::debug!(socket = %self.socket_path.display(), endpoint, "VMM API request");

        let uri: hyper::Uri = Uri::new(&self.socket_path, &format!("/api/v1/{endpoint}")).into();

        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json)
            }
            None => Body::empty(),
        };
        let request = builder.body(body).map_err(|e| VmmError::Transport {
            endpoint: endpoint.to_string(),
            message: format!("failed to build request: {e}"),
        })?;

        let client = Client::unix();
        let response = client
            .request(request)
            .await
            .map_err(|e| VmmError::Transport {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmmError::Transport {
                endpoint: endpoint.to_string(),
                message: format!("failed to read body: {e}"),
            })?;

        if !status.is_success() {
            return Err(VmmError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes)
    }
}

/// The control operations the lifecycle controller needs from a VMM,
/// keyed by the VM's API socket.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_and_boot(&self, socket: &Path, config: &VmConfig) -> Result<()>;
    async fn info(&self, socket: &Path) -> Result<VmInfo>;
    async fn shutdown(&self, socket: &Path) -> Result<()>;
}

/// [`ControlPlane`] over the real unix-socket API.
#[derive(Debug, Clone)]
pub struct UnixSocketControl {
    timeout: Duration,
}

impl UnixSocketControl {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, socket: &Path) -> VmmClient {
        VmmClient::new(socket).with_timeout(self.timeout)
    }
}

impl Default for UnixSocketControl {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl ControlPlane for UnixSocketControl {
    async fn create_and_boot(&self, socket: &Path, config: &VmConfig) -> Result<()> {
        self.client(socket).create_and_boot(config).await
    }

    async fn info(&self, socket: &Path) -> Result<VmInfo> {
        self.client(socket).info().await
    }

    async fn shutdown(&self, socket: &Path) -> Result<()> {
        self.client(socket).shutdown().await
    }
}
