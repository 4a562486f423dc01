//! ssh2-backed transport
//!
//! One [`SshClient`] per host, created by [`SshClientSource`] and cached by
//! the pool. The libssh2 session is not `Sync`, so it lives behind a mutex;
//! the engine's one-worker-per-host rule means the lock is uncontended in
//! practice and exists to keep the type shareable.

use std::io::Read;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ssh2::{CheckResult, HashType, KnownHostFileKind, Session};

use crate::plan::Host;

use super::{Connection, ConnectionSource, ExecOutput, SshError, ssh_config};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on any single remote operation. Generous because package
/// installs and image pulls legitimately take minutes; no wait is unbounded.
const SESSION_TIMEOUT_MS: u32 = 10 * 60 * 1000;

/// Establishes real SSH connections.
pub struct SshClientSource;

impl ConnectionSource for SshClientSource {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, SshError> {
        Ok(Arc::new(SshClient::connect(host)?))
    }
}

/// A live SSH session to one host.
pub struct SshClient {
    endpoint: String,
    session: Mutex<Session>,
    closed: AtomicBool,
}

impl SshClient {
    pub fn connect(host: &Host) -> Result<Self, SshError> {
        let resolved = ssh_config::resolve(&host.endpoint);
        let addr = format!("{}:{}", resolved.hostname, resolved.port);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|source| SshError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| SshError::Connect {
                addr: addr.clone(),
                source: std::io::Error::other("no address resolved"),
            })?;
        let tcp = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT).map_err(|source| {
            SshError::Connect {
                addr: addr.clone(),
                source,
            }
        })?;

        let mut session = Session::new().map_err(|source| SshError::Handshake {
            host: host.endpoint.clone(),
            source,
        })?;
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|source| SshError::Handshake {
            host: host.endpoint.clone(),
            source,
        })?;

        verify_host_key(&session, host, &resolved)?;
        authenticate(&session, host, &resolved)?;

        log::debug!(
            "connected to {} ({}@{}:{})",
            host.endpoint,
            resolved.user,
            resolved.hostname,
            resolved.port
        );

        Ok(Self {
            endpoint: host.endpoint.clone(),
            session: Mutex::new(session),
            closed: AtomicBool::new(false),
        })
    }
}

/// Fail-closed host key verification: a caller-pinned fingerprint when the
/// plan provides one, otherwise `~/.ssh/known_hosts`. Unknown and mismatched
/// keys are both fatal.
fn verify_host_key(
    session: &Session,
    host: &Host,
    resolved: &ssh_config::Resolved,
) -> Result<(), SshError> {
    if let Some(expected) = &host.fingerprint {
        let hash = session
            .host_key_hash(HashType::Sha256)
            .ok_or_else(|| SshError::UnknownHostKey {
                host: host.endpoint.clone(),
            })?;
        let actual = format!("SHA256:{}", STANDARD_NO_PAD.encode(hash));
        if &actual != expected {
            return Err(SshError::HostKeyMismatch {
                host: host.endpoint.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        return Ok(());
    }

    let Some(known_hosts_file) = ssh_config::known_hosts_path() else {
        return Err(SshError::UnknownHostKey {
            host: host.endpoint.clone(),
        });
    };
    let mut known_hosts = session
        .known_hosts()
        .map_err(|source| SshError::Handshake {
            host: host.endpoint.clone(),
            source,
        })?;
    known_hosts
        .read_file(&known_hosts_file, KnownHostFileKind::OpenSSH)
        .map_err(|source| SshError::Handshake {
            host: host.endpoint.clone(),
            source,
        })?;

    let (key, _key_type) = session.host_key().ok_or_else(|| SshError::UnknownHostKey {
        host: host.endpoint.clone(),
    })?;
    match known_hosts.check_port(&resolved.hostname, resolved.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(SshError::HostKeyMismatch {
            host: host.endpoint.clone(),
            expected: "known_hosts entry".to_string(),
            actual: "different key presented by host".to_string(),
        }),
        CheckResult::NotFound | CheckResult::Failure => Err(SshError::UnknownHostKey {
            host: host.endpoint.clone(),
        }),
    }
}

/// Inline key when the plan carries one, SSH agent otherwise.
fn authenticate(
    session: &Session,
    host: &Host,
    resolved: &ssh_config::Resolved,
) -> Result<(), SshError> {
    let result = match &host.key_pem {
        Some(pem) => session.userauth_pubkey_memory(&resolved.user, None, pem, None),
        None => session.userauth_agent(&resolved.user),
    };
    result.map_err(|err| SshError::Auth {
        host: host.endpoint.clone(),
        user: resolved.user.clone(),
        reason: err.to_string(),
    })?;

    if !session.authenticated() {
        return Err(SshError::Auth {
            host: host.endpoint.clone(),
            user: resolved.user.clone(),
            reason: "server rejected all authentication methods".to_string(),
        });
    }
    Ok(())
}

impl Connection for SshClient {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, SshError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let exec_err = |source| SshError::Exec {
            host: self.endpoint.clone(),
            source,
        };
        let io_err = |source| SshError::Io {
            host: self.endpoint.clone(),
            source,
        };

        let mut channel = session.channel_session().map_err(exec_err)?;
        channel.exec(command).map_err(exec_err)?;

        if let Some(data) = stdin {
            channel.write_all(data).map_err(io_err)?;
            channel.send_eof().map_err(exec_err)?;
        }

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(io_err)?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(io_err)?;

        channel.wait_close().map_err(exec_err)?;
        let status = channel.exit_status().map_err(exec_err)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            status,
        })
    }

    fn upload(&self, data: &[u8], remote_path: &str, mode: i32) -> Result<(), SshError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let upload_err = |source| SshError::Upload {
            host: self.endpoint.clone(),
            path: remote_path.to_string(),
            source,
        };

        let mut channel = session
            .scp_send(Path::new(remote_path), mode, data.len() as u64, None)
            .map_err(upload_err)?;
        channel.write_all(data).map_err(|source| SshError::Io {
            host: self.endpoint.clone(),
            source,
        })?;
        channel.send_eof().map_err(upload_err)?;
        channel.wait_eof().map_err(upload_err)?;
        channel.close().map_err(upload_err)?;
        channel.wait_close().map_err(upload_err)?;
        Ok(())
    }

    fn close(&self) -> Result<(), SshError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .disconnect(None, "closing", None)
            .map_err(|source| SshError::Exec {
                host: self.endpoint.clone(),
                source,
            })
    }
}
