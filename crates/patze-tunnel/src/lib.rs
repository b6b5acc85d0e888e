//! SSH forward-tunnel runtime.
//!
//! Opens local→remote TCP forwards over SSH so the control plane can reach a
//! remote bridge's loopback HTTP port as if it were local. libssh2 is a
//! blocking API, so the dial/handshake runs on the blocking pool and each
//! open tunnel owns one dedicated forwarding thread. The runtime only
//! reports tunnel state; reconnection policy belongs to the attachment
//! orchestrator.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ssh2::{CheckResult, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SSH_READY_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PUMP_BUF_SIZE: usize = 16 * 1024;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("private key path must resolve under the user's ~/.ssh directory")]
    KeyOutsideSshDir,
    #[error("private key is not readable")]
    KeyUnreadable(#[source] std::io::Error),
    #[error("could not resolve SSH host")]
    DnsFailed,
    #[error("SSH dial failed")]
    Dial(#[source] std::io::Error),
    #[error("SSH dial timed out")]
    Timeout,
    #[error("host key verification failed")]
    HostVerificationFailed,
    #[error("SSH authentication failed")]
    AuthFailed(#[source] ssh2::Error),
    #[error("SSH protocol error")]
    Ssh(#[from] ssh2::Error),
    #[error("could not bind local forward port")]
    LocalBind(#[source] std::io::Error),
    #[error("tunnel '{0}' not found")]
    NotFound(String),
}

// ─── Request & state ──────────────────────────────────────────────────────────

/// Host-key verification policy. Ad-hoc tunnels must use strict known-hosts
/// checking; bridge-managed tunnels may trust on first use. A key mismatch
/// fails under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostVerification {
    #[default]
    KnownHosts,
    TrustOnFirstUse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenForwardRequest {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,
    #[serde(default)]
    pub host_verification: HostVerification,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Open,
    Disconnected,
    Closed,
}

/// Public view of one tunnel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub local_base_url: String,
    pub state: TunnelState,
    pub opened_at: DateTime<Utc>,
}

struct TunnelHandle {
    info: TunnelInfo,
    state: Arc<Mutex<TunnelState>>,
    shutdown: Arc<AtomicBool>,
}

// ─── Key path confinement ─────────────────────────────────────────────────────

/// A private key must live under `ssh_dir` after lexical normalization; any
/// path that escapes the tree (or is relative) fails fast, before any I/O.
pub fn validate_key_path(key_path: &Path, ssh_dir: &Path) -> Result<PathBuf, TunnelError> {
    let expanded = expand_home(key_path);
    if !expanded.is_absolute() {
        return Err(TunnelError::KeyOutsideSshDir);
    }
    let normalized = normalize_lexical(&expanded);
    if !normalized.starts_with(normalize_lexical(ssh_dir)) {
        return Err(TunnelError::KeyOutsideSshDir);
    }
    Ok(normalized)
}

/// Resolve and confine a key path against the real `~/.ssh`.
pub fn resolve_private_key(key_path: &str) -> Result<PathBuf, TunnelError> {
    let ssh_dir = dirs::home_dir()
        .ok_or(TunnelError::KeyOutsideSshDir)?
        .join(".ssh");
    let path = validate_key_path(Path::new(key_path), &ssh_dir)?;
    std::fs::metadata(&path).map_err(TunnelError::KeyUnreadable)?;
    Ok(path)
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(stripped),
        None => path.to_path_buf(),
    }
}

/// Remove `.` and resolve `..` without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Runtime ──────────────────────────────────────────────────────────────────

/// Owns all open tunnels. Orchestrators hold tunnel ids, never the handles.
pub struct TunnelRuntime {
    tunnels: Mutex<HashMap<String, TunnelHandle>>,
}

impl TunnelRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    /// Open a local→remote forward. Dial + handshake run on the blocking
    /// pool under [`SSH_READY_TIMEOUT`]; on success a dedicated thread
    /// services the local listener until the tunnel is closed.
    pub async fn open_forward(&self, request: OpenForwardRequest) -> Result<TunnelInfo, TunnelError> {
        let key_path = resolve_private_key(&request.private_key_path)?;

        let dial_request = request.clone();
        let dial = tokio::task::spawn_blocking(move || dial_session(&dial_request, &key_path));
        let session = match tokio::time::timeout(SSH_READY_TIMEOUT, dial).await {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(join) => join.map_err(|_| TunnelError::Timeout)??,
        };

        let listener = TcpListener::bind(("127.0.0.1", request.local_port.unwrap_or(0)))
            .map_err(TunnelError::LocalBind)?;
        listener.set_nonblocking(true).map_err(TunnelError::LocalBind)?;
        let local_port = listener.local_addr().map_err(TunnelError::LocalBind)?.port();

        let id = patze_proto::prefixed_id("tun");
        let state = Arc::new(Mutex::new(TunnelState::Open));
        let shutdown = Arc::new(AtomicBool::new(false));

        let info = TunnelInfo {
            id: id.clone(),
            host: request.host.clone(),
            port: request.port,
            user: request.user.clone(),
            remote_host: request.remote_host.clone(),
            remote_port: request.remote_port,
            local_port,
            local_base_url: format!("http://127.0.0.1:{local_port}"),
            state: TunnelState::Open,
            opened_at: Utc::now(),
        };

        {
            let thread_state = state.clone();
            let thread_shutdown = shutdown.clone();
            let thread_id = id.clone();
            let remote_host = request.remote_host.clone();
            let remote_port = request.remote_port;
            std::thread::Builder::new()
                .name(format!("tunnel-{local_port}"))
                .spawn(move || {
                    forward_loop(
                        &thread_id,
                        session,
                        listener,
                        &remote_host,
                        remote_port,
                        &thread_state,
                        &thread_shutdown,
                    );
                })
                .map_err(TunnelError::LocalBind)?;
        }

        info!(tunnel_id = %id, host = %request.host, local_port, "tunnel opened");
        self.tunnels.lock().insert(
            id.clone(),
            TunnelHandle {
                info: info.clone(),
                state,
                shutdown,
            },
        );
        Ok(info)
    }

    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock();
        let mut out: Vec<TunnelInfo> = tunnels
            .values()
            .map(|handle| {
                let mut info = handle.info.clone();
                info.state = *handle.state.lock();
                info
            })
            .collect();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        out
    }

    pub fn get(&self, id: &str) -> Option<TunnelInfo> {
        let tunnels = self.tunnels.lock();
        tunnels.get(id).map(|handle| {
            let mut info = handle.info.clone();
            info.state = *handle.state.lock();
            info
        })
    }

    /// Close a tunnel. Idempotent: closing an unknown id is a no-op.
    pub fn close(&self, id: &str) {
        let removed = self.tunnels.lock().remove(id);
        if let Some(handle) = removed {
            handle.shutdown.store(true, Ordering::SeqCst);
            *handle.state.lock() = TunnelState::Closed;
            info!(tunnel_id = %id, "tunnel closed");
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.tunnels.lock().keys().cloned().collect();
        for id in ids {
            self.close(&id);
        }
    }
}

// ─── SSH session setup ────────────────────────────────────────────────────────

fn dial_session(request: &OpenForwardRequest, key_path: &Path) -> Result<Session, TunnelError> {
    let addrs: Vec<_> = (request.host.as_str(), request.port)
        .to_socket_addrs()
        .map_err(|_| TunnelError::DnsFailed)?
        .collect();
    let addr = addrs.first().ok_or(TunnelError::DnsFailed)?;

    let stream = TcpStream::connect_timeout(addr, SSH_READY_TIMEOUT).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            TunnelError::Timeout
        } else {
            TunnelError::Dial(e)
        }
    })?;

    let mut session = Session::new()?;
    session.set_tcp_stream(stream);
    session.handshake()?;

    verify_host_key(&session, request)?;

    session
        .userauth_pubkey_file(&request.user, None, key_path, None)
        .map_err(TunnelError::AuthFailed)?;
    if !session.authenticated() {
        return Err(TunnelError::AuthFailed(ssh2::Error::from_errno(
            ssh2::ErrorCode::Session(-18),
        )));
    }
    Ok(session)
}

fn known_host_key_format(key_type: ssh2::HostKeyType) -> KnownHostKeyFormat {
    match key_type {
        ssh2::HostKeyType::Rsa => KnownHostKeyFormat::SshRsa,
        ssh2::HostKeyType::Dss => KnownHostKeyFormat::SshDss,
        ssh2::HostKeyType::Ecdsa256 => KnownHostKeyFormat::Ecdsa256,
        ssh2::HostKeyType::Ecdsa384 => KnownHostKeyFormat::Ecdsa384,
        ssh2::HostKeyType::Ecdsa521 => KnownHostKeyFormat::Ecdsa521,
        _ => KnownHostKeyFormat::Ed25519,
    }
}

fn verify_host_key(session: &Session, request: &OpenForwardRequest) -> Result<(), TunnelError> {
    let (key, key_type) = session.host_key().ok_or(TunnelError::HostVerificationFailed)?;

    let known_hosts_path = match &request.known_hosts_path {
        Some(path) => expand_home(Path::new(path)),
        None => dirs::home_dir()
            .ok_or(TunnelError::HostVerificationFailed)?
            .join(".ssh")
            .join("known_hosts"),
    };

    let mut known_hosts = session.known_hosts()?;
    if known_hosts_path.exists() {
        known_hosts.read_file(&known_hosts_path, KnownHostFileKind::OpenSSH)?;
    }

    match known_hosts.check_port(&request.host, request.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => {
            warn!(host = %request.host, "host key mismatch");
            Err(TunnelError::HostVerificationFailed)
        }
        CheckResult::NotFound | CheckResult::Failure => match request.host_verification {
            HostVerification::TrustOnFirstUse => {
                known_hosts.add(
                    &request.host,
                    key,
                    "added by patze-control",
                    known_host_key_format(key_type),
                )?;
                known_hosts.write_file(&known_hosts_path, KnownHostFileKind::OpenSSH)?;
                debug!(host = %request.host, "host key trusted on first use");
                Ok(())
            }
            HostVerification::KnownHosts => Err(TunnelError::HostVerificationFailed),
        },
    }
}

// ─── Forwarding loop ──────────────────────────────────────────────────────────

/// Accept loop for one tunnel. Connections are serviced one at a time:
/// libssh2 sessions are not safe for concurrent channel I/O, and the
/// consumers of these forwards are short health probes and telemetry polls.
fn forward_loop(
    tunnel_id: &str,
    session: Session,
    listener: TcpListener,
    remote_host: &str,
    remote_port: u16,
    state: &Arc<Mutex<TunnelState>>,
    shutdown: &Arc<AtomicBool>,
) {
    session.set_timeout(POLL_INTERVAL.as_millis() as u32);

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((conn, _peer)) => {
                if let Err(e) = pump_connection(&session, conn, remote_host, remote_port, shutdown) {
                    warn!(tunnel_id, error = %e, "tunnel transport error; marking disconnected");
                    let mut s = state.lock();
                    if *s == TunnelState::Open {
                        *s = TunnelState::Disconnected;
                    }
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!(tunnel_id, error = %e, "tunnel listener error");
                let mut s = state.lock();
                if *s == TunnelState::Open {
                    *s = TunnelState::Disconnected;
                }
                return;
            }
        }
    }
    debug!(tunnel_id, "forward loop stopped");
}

/// Copy bytes both ways between one local connection and a direct-tcpip
/// channel until both sides go quiet.
fn pump_connection(
    session: &Session,
    conn: TcpStream,
    remote_host: &str,
    remote_port: u16,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), ssh2::Error> {
    let mut channel = session.channel_direct_tcpip(remote_host, remote_port, None)?;
    let mut conn = conn;
    let _ = conn.set_read_timeout(Some(POLL_INTERVAL));
    let _ = conn.set_nodelay(true);

    let mut buf = [0u8; PUMP_BUF_SIZE];
    let mut local_open = true;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut progressed = false;

        if local_open {
            match conn.read(&mut buf) {
                Ok(0) => {
                    local_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    progressed = true;
                    if channel.write_all(&buf[..n]).is_err() {
                        return Err(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-7)));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => {
                    local_open = false;
                    let _ = channel.send_eof();
                }
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                progressed = true;
                if conn.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(e) => {
                // Session-level timeout means "no data yet"; everything else
                // is a real transport failure.
                let io = std::io::Error::from(e);
                if !matches!(
                    io.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) {
                    return Err(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-43)));
                }
            }
        }

        if channel.eof() && !local_open {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    let _ = channel.close();
    Ok(())
}
