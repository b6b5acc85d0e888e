//! ssh2-backed transport with failure classification.
//!
//! Every libssh2 call runs on the blocking pool; each call opens its own
//! channel on the shared session, serialized by a mutex because libssh2
//! sessions do not tolerate concurrent channel I/O.

use crate::manager::SetupInput;
use crate::{BridgeSession, BridgeTransport, Diagnosis, ExecOutput, PreflightFailureKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Ssh2Transport;

#[async_trait]
impl BridgeTransport for Ssh2Transport {
    async fn connect(&self, input: &SetupInput) -> Result<Box<dyn BridgeSession>, Diagnosis> {
        let input = input.clone();
        let session = tokio::task::spawn_blocking(move || dial(&input))
            .await
            .map_err(|_| Diagnosis::new(PreflightFailureKind::Unknown, "dial task failed"))??;
        Ok(Box::new(Ssh2BridgeSession {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

fn dial(input: &SetupInput) -> Result<Session, Diagnosis> {
    if input.private_key_path.trim().is_empty() {
        return Err(Diagnosis::new(
            PreflightFailureKind::SshAuthMissing,
            "no private key path configured",
        ));
    }
    let key_path = patze_tunnel::resolve_private_key(&input.private_key_path).map_err(|e| {
        let kind = match e {
            patze_tunnel::TunnelError::KeyOutsideSshDir
            | patze_tunnel::TunnelError::KeyUnreadable(_) => PreflightFailureKind::SshKeyUnreadable,
            _ => PreflightFailureKind::Unknown,
        };
        Diagnosis::new(kind, "private key rejected")
    })?;

    let addrs: Vec<_> = (input.host.as_str(), input.port)
        .to_socket_addrs()
        .map_err(|_| Diagnosis::new(PreflightFailureKind::SshDnsFailed, "host did not resolve"))?
        .collect();
    let addr = addrs
        .first()
        .ok_or_else(|| Diagnosis::new(PreflightFailureKind::SshDnsFailed, "host did not resolve"))?;

    let stream = TcpStream::connect_timeout(addr, DIAL_TIMEOUT).map_err(|e| {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => PreflightFailureKind::SshTimeout,
            std::io::ErrorKind::NetworkUnreachable
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::ConnectionRefused => PreflightFailureKind::SshNetworkUnreachable,
            _ => PreflightFailureKind::Unknown,
        };
        Diagnosis::new(kind, format!("tcp connect failed: {}", e.kind()))
    })?;

    let mut session = Session::new()
        .map_err(|_| Diagnosis::new(PreflightFailureKind::Unknown, "libssh2 init failed"))?;
    session.set_tcp_stream(stream);
    session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| Diagnosis::new(PreflightFailureKind::SshTimeout, format!("handshake: {e}")))?;

    verify_host(&session, input)?;

    session
        .userauth_pubkey_file(&input.user, None, &key_path, None)
        .map_err(|e| Diagnosis::new(PreflightFailureKind::SshAuthFailed, format!("auth: {e}")))?;
    if !session.authenticated() {
        return Err(Diagnosis::new(
            PreflightFailureKind::SshAuthFailed,
            "server rejected the key",
        ));
    }
    debug!(host = %input.host, "bridge ssh session established");
    Ok(session)
}

fn verify_host(session: &Session, input: &SetupInput) -> Result<(), Diagnosis> {
    let (key, _) = session.host_key().ok_or_else(|| {
        Diagnosis::new(PreflightFailureKind::SshHostVerificationFailed, "no host key")
    })?;

    let known_hosts_path = dirs::home_dir()
        .map(|h| h.join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            Diagnosis::new(PreflightFailureKind::SshHostVerificationFailed, "no home dir")
        })?;

    let mut known_hosts = session.known_hosts().map_err(|_| {
        Diagnosis::new(PreflightFailureKind::SshHostVerificationFailed, "known_hosts init")
    })?;
    if known_hosts_path.exists() {
        known_hosts
            .read_file(&known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(|_| {
                Diagnosis::new(
                    PreflightFailureKind::SshHostVerificationFailed,
                    "known_hosts unreadable",
                )
            })?;
    }

    match known_hosts.check_port(&input.host, input.port, key) {
        CheckResult::Match => Ok(()),
        // Bridge-managed hosts may trust on first use; a mismatch never may.
        CheckResult::NotFound | CheckResult::Failure if input.trust_on_first_use => Ok(()),
        CheckResult::Mismatch => Err(Diagnosis::new(
            PreflightFailureKind::SshHostVerificationFailed,
            "host key mismatch",
        )),
        _ => Err(Diagnosis::new(
            PreflightFailureKind::SshHostVerificationFailed,
            "host key unknown",
        )),
    }
}

struct Ssh2BridgeSession {
    session: Arc<Mutex<Session>>,
}

impl Ssh2BridgeSession {
    async fn blocking<T, F>(&self, op: F) -> Result<T, Diagnosis>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, Diagnosis> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let session = session.lock();
            op(&session)
        })
        .await
        .map_err(|_| Diagnosis::new(PreflightFailureKind::Unknown, "ssh task failed"))?
    }
}

#[async_trait]
impl BridgeSession for Ssh2BridgeSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, Diagnosis> {
        let command = command.to_string();
        self.blocking(move |session| {
            let mut channel = session.channel_session().map_err(|e| {
                Diagnosis::new(PreflightFailureKind::SshExecFailed, format!("channel: {e}"))
            })?;
            channel.exec(&command).map_err(|e| {
                Diagnosis::new(PreflightFailureKind::SshExecFailed, format!("exec: {e}"))
            })?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            let _ = channel.read_to_string(&mut stdout);
            let _ = channel.stderr().read_to_string(&mut stderr);
            let _ = channel.wait_close();
            let exit_code = channel.exit_status().unwrap_or(-1);

            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        })
        .await
    }

    async fn upload(&self, remote_path: &str, bytes: &[u8]) -> Result<(), Diagnosis> {
        let remote_path = remote_path.to_string();
        let bytes = bytes.to_vec();
        self.blocking(move |session| {
            let sftp = session.sftp().map_err(|e| {
                Diagnosis::new(PreflightFailureKind::SshExecFailed, format!("sftp: {e}"))
            })?;
            if let Some(parent) = Path::new(&remote_path).parent() {
                // Best-effort: parents may already exist.
                let _ = sftp.mkdir(parent, 0o755);
            }
            let mut file = sftp.create(Path::new(&remote_path)).map_err(|e| {
                Diagnosis::new(PreflightFailureKind::SshExecFailed, format!("create: {e}"))
            })?;
            std::io::Write::write_all(&mut file, &bytes).map_err(|e| {
                Diagnosis::new(PreflightFailureKind::SshExecFailed, format!("write: {}", e.kind()))
            })
        })
        .await
    }

    async fn remote_sha256(&self, remote_path: &str) -> Result<Option<String>, Diagnosis> {
        let output = self
            .exec(&format!("sha256sum {remote_path} 2>/dev/null"))
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout
            .split_whitespace()
            .next()
            .map(str::to_string))
    }
}

/// Hex sha256 of local content, compared against [`BridgeSession::remote_sha256`].
pub fn content_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_sha256_is_stable() {
        assert_eq!(content_sha256(b"abc"), content_sha256(b"abc"));
        assert_ne!(content_sha256(b"abc"), content_sha256(b"abd"));
        assert_eq!(content_sha256(b"abc").len(), 64);
    }
}
