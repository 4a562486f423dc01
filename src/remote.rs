//! Structured remote command construction and execution
//!
//! Commands are built as a program plus an argument vector and rendered to a
//! shell string at the last moment, with every argument quoted. Secrets are
//! never interpolated into the command line; they travel over the channel's
//! stdin instead. [`Remote`] wraps a host's pooled connection and splits
//! failures into transport errors (host-fatal) and command errors (the
//! command ran and exited nonzero, fatal only for the resource at hand).

use std::sync::Arc;

use thiserror::Error;

use crate::ssh::{Connection, ExecOutput, SshError};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The transport itself failed; the host is unreachable or broken.
    #[error(transparent)]
    Transport(#[from] SshError),

    /// A remote command ran and exited nonzero.
    #[error("`{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
}

impl RemoteError {
    /// Whether this failure should abort the whole host rather than just
    /// the resource being reconciled.
    pub fn is_host_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// A command to run on a remote host.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    sudo: bool,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            sudo: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Prefix the command with a `KEY=value` environment assignment.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Bytes fed to the remote process's stdin. The only way secrets reach
    /// a host.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Render to a shell string with every argument quoted.
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        if self.sudo {
            parts.push("sudo".to_string());
        }
        for (key, value) in &self.env {
            parts.push(format!("{key}={}", quote(value)));
        }
        parts.push(quote(&self.program));
        for arg in &self.args {
            parts.push(quote(arg));
        }
        parts.join(" ")
    }
}

/// POSIX single-quote an argument unless it is plainly safe.
fn quote(arg: &str) -> String {
    if !arg.is_empty() && arg.bytes().all(is_safe_byte) {
        return arg.to_string();
    }
    let escaped = arg.replace('\'', r"'\''");
    format!("'{escaped}'")
}

fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b',' | b'+')
}

/// A host's connection plus its name for logging and error context.
#[derive(Clone)]
pub struct Remote {
    conn: Arc<dyn Connection>,
    host: String,
}

impl Remote {
    pub fn new(conn: Arc<dyn Connection>, host: impl Into<String>) -> Self {
        Self {
            conn,
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run a command, surfacing only transport errors. The caller inspects
    /// the exit status.
    pub fn exec(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let rendered = cmd.render();
        log::debug!("[{}] {rendered}", self.host);
        Ok(self.conn.exec(&rendered, cmd.stdin_bytes())?)
    }

    /// Run a command that must succeed; a nonzero exit is an error.
    pub fn exec_ok(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let output = self.exec(cmd)?;
        if !output.success() {
            return Err(RemoteError::Command {
                command: cmd.render(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    pub fn upload(&self, data: &[u8], remote_path: &str, mode: i32) -> Result<(), RemoteError> {
        self.conn.upload(data, remote_path, mode)?;
        Ok(())
    }
}
