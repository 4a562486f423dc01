//! Docker daemon hardening
//!
//! Writes the secure defaults to `/etc/docker/daemon.json` when the host's
//! current config differs, then restarts the daemon and waits for it to
//! come back. Idempotent: an already-hardened host gets no writes and no
//! restart.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::remote::{Remote, RemoteCommand, RemoteError};

use super::PERM_PUBLIC_FILE;

const DAEMON_CONFIG_PATH: &str = "/etc/docker/daemon.json";
const STAGING_PATH: &str = "/tmp/caravel-daemon.json";
const NOFILE_LIMIT: u64 = 64_000;

/// How long a restarted daemon gets to answer `docker info`.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(rename = "live-restore")]
    pub live_restore: bool,
    #[serde(rename = "userland-proxy")]
    pub userland_proxy: bool,
    #[serde(rename = "no-new-privileges")]
    pub no_new_privileges: bool,
    pub icc: bool,
    #[serde(rename = "log-driver")]
    pub log_driver: String,
    #[serde(rename = "log-opts")]
    pub log_opts: BTreeMap<String, String>,
    #[serde(rename = "default-ulimits")]
    pub default_ulimits: BTreeMap<String, Ulimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hard")]
    pub hard: u64,
    #[serde(rename = "Soft")]
    pub soft: u64,
}

/// The recommended hardened daemon configuration: no inter-container
/// traffic by default, no userland proxy, bounded logs, raised fd limit.
pub fn secure_defaults() -> DaemonConfig {
    let mut log_opts = BTreeMap::new();
    log_opts.insert("max-size".to_string(), "10m".to_string());
    log_opts.insert("max-file".to_string(), "3".to_string());

    let mut default_ulimits = BTreeMap::new();
    default_ulimits.insert(
        "nofile".to_string(),
        Ulimit {
            name: "nofile".to_string(),
            hard: NOFILE_LIMIT,
            soft: NOFILE_LIMIT,
        },
    );

    DaemonConfig {
        live_restore: true,
        userland_proxy: false,
        no_new_privileges: true,
        icc: false,
        log_driver: "json-file".to_string(),
        log_opts,
        default_ulimits,
    }
}

/// Converge the daemon config to [`secure_defaults`]. Returns whether a
/// restart happened.
pub fn ensure_hardened(remote: &Remote) -> Result<bool, RemoteError> {
    let desired = secure_defaults();

    if let Some(current) = read_config(remote)?
        && current == desired
    {
        log::debug!("[{}] docker daemon already hardened", remote.host());
        return Ok(false);
    }

    write_config(remote, &desired)?;
    restart(remote)?;
    wait_ready(remote, READY_TIMEOUT)?;
    log::info!("[{}] docker daemon hardened and restarted", remote.host());
    Ok(true)
}

fn read_config(remote: &Remote) -> Result<Option<DaemonConfig>, RemoteError> {
    let exists = remote
        .exec(&RemoteCommand::new("test").args(["-f", DAEMON_CONFIG_PATH]))?
        .success();
    if !exists {
        return Ok(None);
    }

    let output = remote.exec_ok(&RemoteCommand::new("cat").arg(DAEMON_CONFIG_PATH))?;
    match serde_json::from_str(&output.stdout) {
        Ok(config) => Ok(Some(config)),
        Err(err) => {
            // An unparseable config counts as divergent and gets replaced.
            log::warn!(
                "[{}] existing {DAEMON_CONFIG_PATH} is unreadable ({err}), will overwrite",
                remote.host()
            );
            Ok(None)
        }
    }
}

fn write_config(remote: &Remote, config: &DaemonConfig) -> Result<(), RemoteError> {
    let json = serde_json::to_string_pretty(config).expect("daemon config serializes");

    remote.exec_ok(&RemoteCommand::new("mkdir").args(["-p", "/etc/docker"]).sudo())?;
    // Staged through /tmp so the privileged write is a single atomic move.
    remote.upload(json.as_bytes(), STAGING_PATH, PERM_PUBLIC_FILE)?;
    remote.exec_ok(
        &RemoteCommand::new("mv")
            .args([STAGING_PATH, DAEMON_CONFIG_PATH])
            .sudo(),
    )?;
    Ok(())
}

fn restart(remote: &Remote) -> Result<(), RemoteError> {
    remote.exec_ok(&RemoteCommand::new("systemctl").args(["restart", "docker"]).sudo())?;
    Ok(())
}

/// Poll `docker info` until the daemon answers or the deadline passes.
pub fn wait_ready(remote: &Remote, timeout: Duration) -> Result<(), RemoteError> {
    let deadline = Instant::now() + timeout;
    loop {
        if remote.exec(&RemoteCommand::new("docker").arg("info"))?.success() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RemoteError::Command {
                command: "docker info".to_string(),
                status: 1,
                stderr: format!("daemon not ready within {timeout:?}"),
            });
        }
        thread::sleep(READY_POLL_INTERVAL);
    }
}
