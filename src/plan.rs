//! The in-memory resource graph: hosts, networks, volumes, containers
//!
//! A [`Plan`] is built once from a validated configuration and consumed by
//! the engine. Resources reference each other by name; hosts are identified
//! by their SSH endpoint string, which is also the connection pool's cache
//! key.
//!
//! Every deployable resource exposes `config_hash()`: a SHA-256 digest over
//! a canonical, sorted, fully-expanded serialization of its desired
//! configuration. File and directory mounts hash by *content*, not path, so
//! moving a file without changing its bytes does not trigger a redeploy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::hash;

/// Registry credentials for `docker login` on a host.
#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// A single ufw rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: String,
    pub comment: String,
    pub rate_limit: bool,
}

/// Desired firewall state for a host.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub default_incoming: String,
    pub default_outgoing: String,
    pub rules: Vec<FirewallRule>,
}

/// A remote Docker host reachable over SSH.
///
/// The endpoint may be an IP address, a hostname, or an `~/.ssh/config`
/// alias, optionally prefixed `user@`. Immutable once the plan is built.
#[derive(Debug, Clone)]
pub struct Host {
    pub endpoint: String,
    /// Expected host key fingerprint (`SHA256:...`). When set, verification
    /// uses this instead of `~/.ssh/known_hosts`.
    pub fingerprint: Option<String>,
    /// Inline private key in OpenSSH PEM format. When set, used instead of
    /// the SSH agent.
    pub key_pem: Option<String>,
    pub packages: Vec<String>,
    pub remove_packages: Vec<String>,
    pub registries: Vec<RegistryCredential>,
    pub firewall: Option<FirewallConfig>,
    pub harden_docker: bool,
}

/// A Docker network scoped to one host.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub host: String,
    pub driver: String,
}

impl Network {
    pub fn config_hash(&self) -> String {
        hash::bytes(format!("{}|{}|{}", self.name, self.driver, self.host).as_bytes())
    }
}

/// A Docker volume scoped to one host.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub host: String,
    pub driver: String,
}

impl Volume {
    pub fn config_hash(&self) -> String {
        hash::bytes(format!("{}|{}|{}", self.name, self.driver, self.host).as_bytes())
    }
}

/// A named-volume or bind mount.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    /// Volume name or absolute host path.
    pub source: String,
    pub target: String,
    /// "ro" or "rw"; empty means the Docker default.
    pub mode: String,
}

/// A local file or directory uploaded to the host and bind-mounted.
#[derive(Debug, Clone)]
pub struct FileMount {
    pub local_path: PathBuf,
    pub container_path: String,
    pub mode: String,
}

/// Raw bytes uploaded to the host and bind-mounted as a file.
#[derive(Debug, Clone)]
pub struct DataMount {
    pub data: Vec<u8>,
    pub container_path: String,
    pub mode: String,
}

/// Health probe variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// HTTP GET expecting a non-error status.
    Http { path: String, port: u16 },
    /// TCP connect.
    Tcp { port: u16 },
    /// Command executed inside the container, expecting exit status 0.
    Command(Vec<String>),
}

/// Health check configuration with polling budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub probe: Probe,
    pub timeout: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl HealthCheck {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_RETRIES: u32 = 5;

    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            timeout: Self::DEFAULT_TIMEOUT,
            interval: Self::DEFAULT_INTERVAL,
            retries: Self::DEFAULT_RETRIES,
        }
    }
}

/// A Docker container scoped to one host.
#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub host: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: Option<String>,
    pub memory: Option<String>,
    pub memory_reservation: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub pids_limit: Option<u64>,
    /// Networks to attach, by name. The first is passed to `docker run`;
    /// the rest are connected afterwards.
    pub networks: Vec<String>,
    pub network_alias: Option<String>,
    pub ports: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub mounts: Vec<FileMount>,
    pub data_mounts: Vec<DataMount>,
    /// Mount point -> options. Options always include
    /// `noexec,nosuid,nodev`; the config layer enforces that.
    pub tmpfs: BTreeMap<String, String>,
    pub env_file: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub health_check: Option<HealthCheck>,
    pub depends_on: Vec<String>,
    pub read_only: bool,
    pub security_opts: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub groups: Vec<String>,
    pub restart: String,
}

impl Container {
    /// SHA-256 over the canonical serialization of every configuration
    /// field. Unordered collections are sorted (env and labels are
    /// `BTreeMap`s, the network list is sorted here) so the digest is
    /// deterministic across runs.
    pub fn config_hash(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        parts.push(self.name.clone());
        parts.push(self.image.clone());
        if !self.command.is_empty() {
            parts.push(format!("cmd:{}", self.command.join(" ")));
        }
        if let Some(user) = &self.user {
            parts.push(format!("user:{user}"));
        }
        if let Some(memory) = &self.memory {
            parts.push(format!("memory:{memory}"));
        }
        if let Some(reservation) = &self.memory_reservation {
            parts.push(format!("memory-reservation:{reservation}"));
        }
        if let Some(shares) = self.cpu_shares {
            parts.push(format!("cpu-shares:{shares}"));
        }
        if let Some(quota) = self.cpu_quota {
            parts.push(format!("cpu-quota:{quota}"));
        }
        if let Some(limit) = self.pids_limit {
            parts.push(format!("pids-limit:{limit}"));
        }

        let mut networks = self.networks.clone();
        networks.sort();
        parts.push(format!("networks:{}", networks.join(",")));
        if let Some(alias) = &self.network_alias {
            parts.push(format!("alias:{alias}"));
        }
        parts.push(format!("ports:{}", self.ports.join(",")));
        parts.push(format!("extra-hosts:{}", self.extra_hosts.join(",")));

        for v in &self.volumes {
            parts.push(format!("volume:{}:{}:{}", v.source, v.target, v.mode));
        }

        // File and directory mounts hash by content. On failure, degrade to
        // the path with a warning: better a false redeploy than a crash.
        for mount in &self.mounts {
            match hash::path(&mount.local_path) {
                Ok(content_hash) => parts.push(format!(
                    "mount:{}:{}:{}",
                    content_hash, mount.container_path, mount.mode
                )),
                Err(err) => {
                    log::warn!(
                        "failed to hash mount content at {}, using path instead: {err}",
                        mount.local_path.display()
                    );
                    parts.push(format!(
                        "mount:{}:{}:{}",
                        mount.local_path.display(),
                        mount.container_path,
                        mount.mode
                    ));
                }
            }
        }

        for mount in &self.data_mounts {
            parts.push(format!(
                "datamount:{}:{}:{}",
                hash::bytes(&mount.data),
                mount.container_path,
                mount.mode
            ));
        }

        for (mount_point, options) in &self.tmpfs {
            parts.push(format!("tmpfs:{mount_point}:{options}"));
        }

        if let Some(env_file) = &self.env_file {
            match hash::file(env_file) {
                Ok(content_hash) => parts.push(format!("envfile:{content_hash}")),
                Err(err) => {
                    log::warn!(
                        "failed to hash env file {}, using path instead: {err}",
                        env_file.display()
                    );
                    parts.push(format!("envfile:{}", env_file.display()));
                }
            }
        }

        for (key, value) in &self.env {
            parts.push(format!("{key}={value}"));
        }
        for (key, value) in &self.labels {
            parts.push(format!("label:{key}={value}"));
        }

        parts.push(format!("readonly={}", self.read_only));
        parts.push(self.security_opts.join(","));
        parts.push(self.cap_drop.join(","));
        parts.push(self.cap_add.join(","));
        parts.push(self.groups.join(","));
        parts.push(self.restart.clone());

        hash::bytes(parts.join("|").as_bytes())
    }
}

/// The root aggregate: everything one reconciliation run deploys.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Used as the tracking label value on every created resource.
    pub name: String,
    pub hosts: Vec<Host>,
    pub networks: Vec<Network>,
    pub volumes: Vec<Volume>,
    pub containers: Vec<Container>,
}

impl Plan {
    pub fn host(&self, endpoint: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.endpoint == endpoint)
    }
}
