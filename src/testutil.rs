//! Scripted in-memory transport for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::plan::Host;
use crate::ssh::{Connection, ConnectionSource, ExecOutput, SshError};

/// One exec observed by the fake transport.
#[derive(Debug, Clone)]
pub struct RecordedExec {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: i32,
}

struct Rule {
    pattern: String,
    output: ExecOutput,
}

/// A connection whose command responses are scripted by substring match.
///
/// Every exec is matched against the rules in order; the first rule whose
/// pattern is contained in the rendered command wins. Unmatched commands
/// succeed with empty output, which matches how most idempotent probes are
/// interpreted.
#[derive(Default)]
pub struct ScriptedConnection {
    rules: Mutex<Vec<Rule>>,
    pub execs: Mutex<Vec<RecordedExec>>,
    pub uploads: Mutex<Vec<RecordedUpload>>,
    closed: AtomicBool,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script stdout for commands containing `pattern`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.respond_with(pattern, stdout, "", 0);
    }

    /// Script a failing response for commands containing `pattern`.
    pub fn fail(&self, pattern: &str, stderr: &str, status: i32) {
        self.respond_with(pattern, "", stderr, status);
    }

    pub fn respond_with(&self, pattern: &str, stdout: &str, stderr: &str, status: i32) {
        self.rules
            .lock()
            .expect("rules lock")
            .push(Rule {
                pattern: pattern.to_string(),
                output: ExecOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    status,
                },
            });
    }

    pub fn commands(&self) -> Vec<String> {
        self.execs
            .lock()
            .expect("execs lock")
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().expect("uploads lock").len()
    }
}

impl Connection for ScriptedConnection {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, SshError> {
        self.execs.lock().expect("execs lock").push(RecordedExec {
            command: command.to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
        });

        let rules = self.rules.lock().expect("rules lock");
        let output = rules
            .iter()
            .find(|r| command.contains(&r.pattern))
            .map(|r| r.output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    fn upload(&self, data: &[u8], remote_path: &str, mode: i32) -> Result<(), SshError> {
        self.uploads
            .lock()
            .expect("uploads lock")
            .push(RecordedUpload {
                path: remote_path.to_string(),
                data: data.to_vec(),
                mode,
            });
        Ok(())
    }

    fn close(&self) -> Result<(), SshError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built scripted connections keyed by endpoint.
pub struct ScriptedSource {
    connections: Mutex<Vec<(String, Arc<ScriptedConnection>)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, endpoint: &str, conn: Arc<ScriptedConnection>) {
        self.connections
            .lock()
            .expect("connections lock")
            .push((endpoint.to_string(), conn));
    }
}

impl ConnectionSource for ScriptedSource {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, SshError> {
        let connections = self.connections.lock().expect("connections lock");
        connections
            .iter()
            .find(|(endpoint, _)| endpoint == &host.endpoint)
            .map(|(_, conn)| Arc::clone(conn) as Arc<dyn Connection>)
            .ok_or_else(|| SshError::UnknownHostKey {
                host: host.endpoint.clone(),
            })
    }
}

/// A bare host for tests that only need an endpoint.
pub fn host(endpoint: &str) -> Host {
    Host {
        endpoint: endpoint.to_string(),
        fingerprint: None,
        key_pem: None,
        packages: Vec::new(),
        remove_packages: Vec::new(),
        registries: Vec::new(),
        firewall: None,
        harden_docker: false,
    }
}
