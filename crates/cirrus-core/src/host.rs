//! Host capabilities used by the driver: link management through iproute2,
//! interface lookup, and VMM/virtiofsd process supervision.

use crate::error::HostError;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Bound on a single host tool invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run a command to completion, returning stdout.
pub(crate) async fn run<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> Result<String, HostError> {
    let name = program.as_ref().to_string_lossy().into_owned();
    let output = Command::new(program.as_ref())
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(HostError::Timeout {
                program: name,
                timeout,
            })
        }
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(HostError::Command {
            program: name,
            status: output.status.code(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Link-level host networking.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Make sure `bridge` exists, carries `gateway/prefix` and is up.
    async fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix: u8) -> Result<(), HostError>;
    /// Create a TAP device attached to `bridge` and bring it up.
    async fn create_tap(&self, tap: &str, bridge: &str) -> Result<(), HostError>;
    /// Remove a TAP device. A device that no longer exists is not an error.
    async fn delete_tap(&self, tap: &str) -> Result<(), HostError>;
}

/// [`HostNetwork`] backed by the `ip` tool.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    bin: PathBuf,
    timeout: Duration,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new("ip", COMMAND_TIMEOUT)
    }
}

impl IpRoute2 {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<String, HostError> {
        tracing::debug!(args = ?args, "ip");
        run(&self.bin, args, self.timeout).await
    }
}

/// `RTNETLINK answers: File exists` and friends.
fn already_exists(err: &HostError) -> bool {
    matches!(err, HostError::Command { message, .. } if message.to_ascii_lowercase().contains("file exists"))
}

fn no_such_device(err: &HostError) -> bool {
    matches!(err, HostError::Command { message, .. }
        if message.contains("Cannot find device") || message.contains("does not exist"))
}

#[async_trait]
impl HostNetwork for IpRoute2 {
    async fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix: u8) -> Result<(), HostError> {
        if self.ip(&["link", "show", bridge]).await.is_err() {
            tracing::info!(bridge, "Creating bridge");
            match self.ip(&["link", "add", "name", bridge, "type", "bridge"]).await {
                Err(e) if !already_exists(&e) => return Err(e),
                _ => {}
            }
        }

        let cidr = format!("{gateway}/{prefix}");
        match self.ip(&["addr", "add", &cidr, "dev", bridge]).await {
            Err(e) if !already_exists(&e) => return Err(e),
            _ => {}
        }

        self.ip(&["link", "set", bridge, "up"]).await?;
        tracing::info!(bridge, gateway = %cidr, "Bridge configured");
        Ok(())
    }

    async fn create_tap(&self, tap: &str, bridge: &str) -> Result<(), HostError> {
        self.ip(&["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
        let attach = async {
            self.ip(&["link", "set", tap, "master", bridge]).await?;
            self.ip(&["link", "set", tap, "up"]).await
        };
        if let Err(e) = attach.await {
            // Don't leave a half-configured interface behind.
            if let Err(cleanup) = self.ip(&["link", "delete", tap]).await {
                tracing::debug!(tap, error = %cleanup, "Failed to delete half-configured TAP");
            }
            return Err(e);
        }
        tracing::debug!(tap, bridge, "TAP interface created");
        Ok(())
    }

    async fn delete_tap(&self, tap: &str) -> Result<(), HostError> {
        match self.ip(&["link", "delete", tap]).await {
            Err(e) if no_such_device(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

/// Lookups against the host's interface table.
pub trait InterfaceResolver: Send + Sync {
    /// Name of the interface carrying `ip`.
    fn interface_by_ip(&self, ip: Ipv4Addr) -> Option<String>;
    fn interface_exists(&self, name: &str) -> bool;
}

/// [`InterfaceResolver`] using `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostInterfaces;

impl InterfaceResolver for HostInterfaces {
    fn interface_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list host interfaces");
                return None;
            }
        };
        addrs
            .filter(|ifa| {
                ifa.address
                    .as_ref()
                    .and_then(|a| a.as_sockaddr_in())
                    .map(|sin| Ipv4Addr::from(sin.ip()) == ip)
                    .unwrap_or(false)
            })
            .map(|ifa| ifa.interface_name)
            .next()
    }

    fn interface_exists(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        nix::ifaddrs::getifaddrs()
            .map(|mut addrs| addrs.any(|ifa| ifa.interface_name == name))
            .unwrap_or(false)
    }
}

/// How to start a VMM process.
#[derive(Debug, Clone)]
pub struct VmmLaunch {
    pub bin: PathBuf,
    pub api_socket: PathBuf,
    pub log_file: PathBuf,
    pub seccomp: bool,
    /// How long to wait for the API socket to appear.
    pub startup_timeout: Duration,
}

impl VmmLaunch {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--api-socket".to_string(),
            format!("path={}", self.api_socket.display()),
            "--log-file".to_string(),
            self.log_file.display().to_string(),
        ];
        if !self.seccomp {
            args.push("--seccomp".to_string());
            args.push("false".to_string());
        }
        args
    }
}

/// How to start a virtiofsd helper for one share.
#[derive(Debug, Clone)]
pub struct VirtiofsdLaunch {
    pub bin: PathBuf,
    pub socket: PathBuf,
    pub shared_dir: PathBuf,
    pub log_file: PathBuf,
    pub startup_timeout: Duration,
}

impl VirtiofsdLaunch {
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("--socket-path={}", self.socket.display()),
            format!("--shared-dir={}", self.shared_dir.display()),
            "--cache=auto".to_string(),
        ]
    }
}

/// Supervision of the VMM and helper processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a VMM and wait for its API socket. Returns the pid.
    async fn launch_vmm(&self, spec: &VmmLaunch) -> Result<u32, HostError>;
    /// Start a virtiofsd helper and wait for its socket. Returns the pid.
    async fn launch_virtiofsd(&self, spec: &VirtiofsdLaunch) -> Result<u32, HostError>;
    /// SIGTERM, then SIGKILL once `grace` has passed.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<(), HostError>;
    fn is_alive(&self, pid: u32) -> bool;
    /// First line of `<bin> --version`.
    async fn version(&self, bin: &Path) -> Result<String, HostError>;
}

/// [`ProcessLauncher`] that spawns real processes and keeps their handles
/// so exits are reaped.
#[derive(Debug, Default)]
pub struct HostProcesses {
    children: Mutex<HashMap<u32, Child>>,
}

impl HostProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    async fn spawn_and_wait(
        &self,
        bin: &Path,
        args: &[String],
        log_file: &Path,
        socket: &Path,
        timeout: Duration,
    ) -> Result<u32, HostError> {
        // Remove a stale socket from a previous run.
        if let Err(e) = tokio::fs::remove_file(socket).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(socket = %socket.display(), error = %e, "Stale socket not removed");
            }
        }

        let log = File::create(log_file)?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        let pid = child.id().ok_or_else(|| HostError::Command {
            program: bin.display().to_string(),
            status: None,
            message: "process exited before reporting a pid".into(),
        })?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if socket.exists() {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                let tail = std::fs::read_to_string(log_file)
                    .map(|s| s.lines().rev().take(10).collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                return Err(HostError::Command {
                    program: bin.display().to_string(),
                    status: status.code(),
                    message: format!("exited during startup: {tail}"),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                if let Err(e) = child.kill().await {
                    tracing::debug!(pid, error = %e, "Failed to kill unresponsive process");
                }
                return Err(HostError::SocketWait(socket.to_path_buf()));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        self.children
            .lock()
            .map_err(|_| HostError::Io(std::io::Error::other("process table poisoned")))?
            .insert(pid, child);
        Ok(pid)
    }

    fn take_child(&self, pid: u32) -> Option<Child> {
        self.children.lock().ok().and_then(|mut map| map.remove(&pid))
    }
}

fn signal(pid: u32, sig: Signal) -> Result<(), HostError> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HostError::Io(std::io::Error::from(e))),
    }
}

#[async_trait]
impl ProcessLauncher for HostProcesses {
    async fn launch_vmm(&self, spec: &VmmLaunch) -> Result<u32, HostError> {
        let pid = self
            .spawn_and_wait(
                &spec.bin,
                &spec.args(),
                &spec.log_file,
                &spec.api_socket,
                spec.startup_timeout,
            )
            .await?;
        tracing::info!(pid, socket = %spec.api_socket.display(), "VMM started");
        Ok(pid)
    }

    async fn launch_virtiofsd(&self, spec: &VirtiofsdLaunch) -> Result<u32, HostError> {
        let pid = self
            .spawn_and_wait(
                &spec.bin,
                &spec.args(),
                &spec.log_file,
                &spec.socket,
                spec.startup_timeout,
            )
            .await?;
        tracing::info!(pid, shared_dir = %spec.shared_dir.display(), "virtiofsd started");
        Ok(pid)
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<(), HostError> {
        signal(pid, Signal::SIGTERM)?;

        if let Some(mut child) = self.take_child(pid) {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!(pid, "Process ignored SIGTERM, killing");
                child.kill().await?;
            }
            return Ok(());
        }

        // Not one of ours; poll until it disappears.
        let deadline = tokio::time::Instant::now() + grace;
        while self.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pid, "Process ignored SIGTERM, killing");
                return signal(pid, Signal::SIGKILL);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        // Reap our own children first so a zombie does not look alive.
        if let Ok(mut children) = self.children.lock() {
            if let Some(child) = children.get_mut(&pid) {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    children.remove(&pid);
                    return false;
                }
            }
        }
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn version(&self, bin: &Path) -> Result<String, HostError> {
        let out = run(bin, &["--version"], COMMAND_TIMEOUT).await?;
        Ok(out.lines().next().unwrap_or_default().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmm_args() {
        let spec = VmmLaunch {
            bin: PathBuf::from("/usr/bin/cloud-hypervisor"),
            api_socket: PathBuf::from("/var/lib/cirrus/vm1/api.sock"),
            log_file: PathBuf::from("/var/lib/cirrus/vm1/vmm.log"),
            seccomp: false,
            startup_timeout: Duration::from_secs(60),
        };
        assert_eq!(
            spec.args(),
            vec![
                "--api-socket",
                "path=/var/lib/cirrus/vm1/api.sock",
                "--log-file",
                "/var/lib/cirrus/vm1/vmm.log",
                "--seccomp",
                "false"
            ]
        );

        let spec = VmmLaunch { seccomp: true, ..spec };
        assert!(!spec.args().contains(&"--seccomp".to_string()));
    }

    #[test]
    fn test_virtiofsd_args() {
        let spec = VirtiofsdLaunch {
            bin: PathBuf::from("/usr/libexec/virtiofsd"),
            socket: PathBuf::from("/var/lib/cirrus/vm1/fs-data.sock"),
            shared_dir: PathBuf::from("/srv/data"),
            log_file: PathBuf::from("/var/lib/cirrus/vm1/virtiofsd-data.log"),
            startup_timeout: Duration::from_secs(60),
        };
        let args = spec.args();
        assert_eq!(args[0], "--socket-path=/var/lib/cirrus/vm1/fs-data.sock");
        assert_eq!(args[1], "--shared-dir=/srv/data");
    }

    #[test]
    fn test_error_classifiers() {
        let exists = HostError::Command {
            program: "ip".into(),
            status: Some(2),
            message: "RTNETLINK answers: File exists".into(),
        };
        assert!(already_exists(&exists));
        let gone = HostError::Command {
            program: "ip".into(),
            status: Some(1),
            message: "Cannot find device \"tap1234\"".into(),
        };
        assert!(no_such_device(&gone));
        assert!(!already_exists(&gone));
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"], COMMAND_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            HostError::Command { status, message, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let err = run("sleep", &["5"], Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HostError::Timeout { .. }));
    }

    /// Stand-in `ip` that records its arguments and fails the bridge attach.
    fn scripted_ip(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let log = dir.join("calls.log");
        let bin = dir.join("ip");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> {}\ncase \"$*\" in\n  *master*) echo 'Cannot find device \"br9\"' >&2; exit 1;;\n  'link delete'*) echo 'Operation not permitted' >&2; exit 2;;\nesac\n",
            log.display()
        );
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        (bin, log)
    }

    #[tokio::test]
    async fn test_create_tap_cleans_up_after_attach_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, log) = scripted_ip(dir.path());
        let net = IpRoute2::new(bin, COMMAND_TIMEOUT);

        // The attach error wins over the failed cleanup.
        let err = net.create_tap("tap0", "br9").await.unwrap_err();
        match err {
            HostError::Command { status, message, .. } => {
                assert_eq!(status, Some(1));
                assert!(message.contains("Cannot find device"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let calls = std::fs::read_to_string(log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "tuntap add dev tap0 mode tap",
                "link set tap0 master br9",
                "link delete tap0"
            ]
        );
    }

    #[test]
    fn test_default_uses_path_lookup() {
        let net = IpRoute2::default();
        assert_eq!(net.bin, PathBuf::from("ip"));
        assert_eq!(net.timeout, COMMAND_TIMEOUT);
    }

    #[test]
    fn test_own_process_is_alive() {
        let procs = HostProcesses::new();
        assert!(procs.is_alive(std::process::id()));
    }
}
