//! SSH transport: clients, connection pooling, endpoint resolution
//!
//! The engine talks to hosts through the [`Connection`] trait, obtained from
//! a [`ConnectionSource`]. Production code wires in [`client::SshClient`]
//! behind [`pool::ConnectionPool`]; tests substitute scripted fakes. SSH
//! failures are host-fatal by design: a transport error aborts that host's
//! run, never the whole deployment.

use std::sync::Arc;

use thiserror::Error;

use crate::plan::Host;

pub mod client;
pub mod pool;
pub mod ssh_config;

/// Transport-level failures. Any of these aborts the affected host.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    /// Fail closed: a changed host key is treated as a possible
    /// man-in-the-middle, never as something to shrug off.
    #[error("host key verification failed for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("host key verification failed for {host}: not present in known_hosts")]
    UnknownHostKey { host: String },

    #[error("authentication failed for {user}@{host}: {reason}")]
    Auth {
        host: String,
        user: String,
        reason: String,
    },

    #[error("command execution on {host} failed: {source}")]
    Exec {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("upload to {host}:{path} failed: {source}")]
    Upload {
        host: String,
        path: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("I/O error talking to {host}: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close {failed} of {total} connections: {}", .errors.join("; "))]
    Close {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },
}

/// Output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout with trailing newline removed, the usual shape for parsing
    /// single-value command output.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches('\n')
    }
}

/// An established transport to one host.
///
/// Implementations serialize their own command execution; the engine
/// additionally runs at most one worker per host, so commands on a host
/// never interleave.
pub trait Connection: Send + Sync {
    /// Run a shell command, optionally feeding bytes to its stdin. A nonzero
    /// exit status is *not* an `SshError` -- the caller decides what a
    /// failing command means.
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, SshError>;

    /// Write bytes to a remote path with the given mode.
    fn upload(&self, data: &[u8], remote_path: &str, mode: i32) -> Result<(), SshError>;

    /// Tear the transport down. Idempotent.
    fn close(&self) -> Result<(), SshError>;
}

/// Something that can establish connections. The seam between the pool and
/// the concrete SSH backend.
pub trait ConnectionSource: Send + Sync {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, SshError>;
}
