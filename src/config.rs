//! Plan file loading and validation
//!
//! A plan is a TOML document describing hosts and the resources to converge
//! on them. Deserialization is permissive (serde defaults everywhere);
//! `validate()` then checks the whole document and returns *every* problem
//! at once as a list of typed errors. Only a validated config can be turned
//! into a [`Plan`](crate::plan::Plan), so the engine never sees a
//! half-formed resource.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use reconcile::{DependencyGraph, GraphError};

use crate::plan::{
    Container, DataMount, FileMount, FirewallConfig, FirewallRule, HealthCheck, Host, Network,
    Plan, Probe, RegistryCredential, Volume, VolumeMount,
};

/// A single problem found while validating a plan file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plan name must not be empty")]
    EmptyPlanName,

    #[error("duplicate host `{0}`")]
    DuplicateHost(String),

    #[error("duplicate {kind} `{name}` on host `{host}`")]
    DuplicateResource {
        kind: &'static str,
        name: String,
        host: String,
    },

    #[error("{kind} `{name}` references unknown host `{host}`")]
    UnknownHost {
        kind: &'static str,
        name: String,
        host: String,
    },

    #[error("container `{container}` has no image")]
    MissingImage { container: String },

    #[error("container `{container}` attaches unknown network `{network}`")]
    UnknownNetwork { container: String, network: String },

    #[error("container `{container}` mounts unknown volume `{volume}`")]
    UnknownVolume { container: String, volume: String },

    #[error("container `{container}` has a malformed mount or port entry `{entry}`")]
    BadMountOrPort { container: String, entry: String },

    #[error(
        "container `{container}` depends on `{dependency}`, which is not a container on the same host"
    )]
    BadDependency {
        container: String,
        dependency: String,
    },

    #[error("containers on host `{host}` form a dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { host: String, cycle: Vec<String> },

    #[error("container `{container}` has an invalid health check: {reason}")]
    BadHealthCheck { container: String, reason: String },

    #[error(
        "file mount `{target}` on container `{container}` must set exactly one of `source` or `content`"
    )]
    AmbiguousFileMount { container: String, target: String },

    #[error("host `{host}` firewall: {reason}")]
    BadFirewall { host: String, reason: String },
}

fn default_network_driver() -> String {
    "bridge".to_string()
}

fn default_volume_driver() -> String {
    "local".to_string()
}

fn default_restart() -> String {
    "unless-stopped".to_string()
}

fn default_mount_mode() -> String {
    "ro".to_string()
}

fn default_firewall_incoming() -> String {
    "deny".to_string()
}

fn default_firewall_outgoing() -> String {
    "allow".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub endpoint: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Path to a private key file; defaults to the SSH agent when unset.
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub remove_packages: Vec<String>,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    #[serde(default)]
    pub firewall: Option<FirewallSection>,
    #[serde(default)]
    pub harden_docker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub registry: String,
    pub username: String,
    /// Environment variable holding the password. Keeps secrets out of the
    /// plan file.
    pub password_env: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallSection {
    #[serde(default = "default_firewall_incoming")]
    pub default_incoming: String,
    #[serde(default = "default_firewall_outgoing")]
    pub default_outgoing: String,
    #[serde(default)]
    pub rules: Vec<FirewallRuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallRuleConfig {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub rate_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_network_driver")]
    pub driver: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_volume_driver")]
    pub driver: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub name: String,
    pub host: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub memory_reservation: Option<String>,
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub pids_limit: Option<u64>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub network_alias: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    /// `source:target[:mode]` entries; a source starting with `/` is a bind
    /// mount, anything else must name a declared volume on the same host.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileMountConfig>,
    /// Mount point -> options; `noexec,nosuid,nodev` are always enforced.
    #[serde(default)]
    pub tmpfs: BTreeMap<String, String>,
    #[serde(default)]
    pub env_file: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub security_opts: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_restart")]
    pub restart: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMountConfig {
    /// Local file or directory, relative to the plan file.
    #[serde(default)]
    pub source: Option<String>,
    /// Inline file content; mutually exclusive with `source`.
    #[serde(default)]
    pub content: Option<String>,
    pub target: String,
    #[serde(default = "default_mount_mode")]
    pub mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// "http", "tcp", or "command".
    pub kind: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

impl PlanConfig {
    /// Load a plan file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read plan file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid plan file {}", path.display()))
    }

    /// Check the whole document. Returns every problem found, not just the
    /// first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::EmptyPlanName);
        }

        let mut host_endpoints = HashSet::new();
        for host in &self.hosts {
            if !host_endpoints.insert(host.endpoint.as_str()) {
                errors.push(ValidationError::DuplicateHost(host.endpoint.clone()));
            }
            if let Some(fw) = &host.firewall {
                check_firewall(&host.endpoint, fw, &mut errors);
            }
        }

        self.check_resource_names(&mut errors);

        let known_host = |endpoint: &str| self.hosts.iter().any(|h| h.endpoint == endpoint);

        for network in &self.networks {
            if !known_host(&network.host) {
                errors.push(ValidationError::UnknownHost {
                    kind: "network",
                    name: network.name.clone(),
                    host: network.host.clone(),
                });
            }
        }
        for volume in &self.volumes {
            if !known_host(&volume.host) {
                errors.push(ValidationError::UnknownHost {
                    kind: "volume",
                    name: volume.name.clone(),
                    host: volume.host.clone(),
                });
            }
        }

        for container in &self.containers {
            self.check_container(container, known_host(&container.host), &mut errors);
        }

        self.check_dependencies(&mut errors);

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_resource_names(&self, errors: &mut Vec<ValidationError>) {
        let mut seen: HashSet<(&'static str, &str, &str)> = HashSet::new();
        let named = self
            .networks
            .iter()
            .map(|n| ("network", n.name.as_str(), n.host.as_str()))
            .chain(
                self.volumes
                    .iter()
                    .map(|v| ("volume", v.name.as_str(), v.host.as_str())),
            )
            .chain(
                self.containers
                    .iter()
                    .map(|c| ("container", c.name.as_str(), c.host.as_str())),
            );
        for (kind, name, host) in named {
            if !seen.insert((kind, name, host)) {
                errors.push(ValidationError::DuplicateResource {
                    kind,
                    name: name.to_string(),
                    host: host.to_string(),
                });
            }
        }
    }

    fn check_container(
        &self,
        container: &ContainerConfig,
        host_known: bool,
        errors: &mut Vec<ValidationError>,
    ) {
        if !host_known {
            errors.push(ValidationError::UnknownHost {
                kind: "container",
                name: container.name.clone(),
                host: container.host.clone(),
            });
        }

        if container.image.trim().is_empty() {
            errors.push(ValidationError::MissingImage {
                container: container.name.clone(),
            });
        }

        for network in &container.networks {
            let declared = self
                .networks
                .iter()
                .any(|n| n.name == *network && n.host == container.host);
            if !declared {
                errors.push(ValidationError::UnknownNetwork {
                    container: container.name.clone(),
                    network: network.clone(),
                });
            }
        }

        for entry in &container.volumes {
            match parse_volume_mount(entry) {
                Some(mount) if !mount.source.starts_with('/') => {
                    let declared = self
                        .volumes
                        .iter()
                        .any(|v| v.name == mount.source && v.host == container.host);
                    if !declared {
                        errors.push(ValidationError::UnknownVolume {
                            container: container.name.clone(),
                            volume: mount.source,
                        });
                    }
                }
                Some(_) => {}
                None => errors.push(ValidationError::BadMountOrPort {
                    container: container.name.clone(),
                    entry: entry.clone(),
                }),
            }
        }

        for port in &container.ports {
            if !port_mapping_ok(port) {
                errors.push(ValidationError::BadMountOrPort {
                    container: container.name.clone(),
                    entry: port.clone(),
                });
            }
        }

        for file in &container.files {
            if file.source.is_some() == file.content.is_some() {
                errors.push(ValidationError::AmbiguousFileMount {
                    container: container.name.clone(),
                    target: file.target.clone(),
                });
            }
        }

        if let Some(hc) = &container.health_check
            && let Err(reason) = check_health_config(hc)
        {
            errors.push(ValidationError::BadHealthCheck {
                container: container.name.clone(),
                reason,
            });
        }
    }

    fn check_dependencies(&self, errors: &mut Vec<ValidationError>) {
        let mut dangling = false;
        for container in &self.containers {
            for dep in &container.depends_on {
                let same_host = self
                    .containers
                    .iter()
                    .any(|c| c.name == *dep && c.host == container.host);
                if !same_host {
                    dangling = true;
                    errors.push(ValidationError::BadDependency {
                        container: container.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if dangling {
            // Cycle detection only runs on a graph with resolved edges.
            return;
        }

        let hosts: HashSet<&str> = self.containers.iter().map(|c| c.host.as_str()).collect();
        for host in hosts {
            let nodes: Vec<(String, Vec<String>)> = self
                .containers
                .iter()
                .filter(|c| c.host == host)
                .map(|c| (c.name.clone(), c.depends_on.clone()))
                .collect();
            let Ok(graph) = DependencyGraph::build(&nodes) else {
                continue;
            };
            if let Err(GraphError::Cycle(cycle)) = graph.creation_order() {
                errors.push(ValidationError::DependencyCycle {
                    host: host.to_string(),
                    cycle,
                });
            }
        }
    }

    /// Turn a validated config into the resource graph the engine consumes.
    ///
    /// `base_dir` anchors relative mount and key paths (the plan file's
    /// directory). Reads key files and resolves registry passwords from the
    /// environment, so it can fail even after validation.
    pub fn into_plan(self, base_dir: &Path) -> Result<Plan> {
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            let key_pem = match &host.key_file {
                Some(key_file) => {
                    let path = resolve_path(base_dir, key_file);
                    Some(
                        fs::read_to_string(&path)
                            .with_context(|| format!("could not read key file {}", path.display()))?,
                    )
                }
                None => None,
            };
            let mut registries = Vec::with_capacity(host.registries.len());
            for registry in &host.registries {
                let password = std::env::var(&registry.password_env).with_context(|| {
                    format!(
                        "registry password variable {} not set (host {}, registry {})",
                        registry.password_env, host.endpoint, registry.registry
                    )
                })?;
                registries.push(RegistryCredential {
                    registry: registry.registry.clone(),
                    username: registry.username.clone(),
                    password,
                });
            }
            hosts.push(Host {
                endpoint: host.endpoint,
                fingerprint: host.fingerprint,
                key_pem,
                packages: host.packages,
                remove_packages: host.remove_packages,
                registries,
                firewall: host.firewall.map(|fw| FirewallConfig {
                    default_incoming: fw.default_incoming,
                    default_outgoing: fw.default_outgoing,
                    rules: fw
                        .rules
                        .into_iter()
                        .map(|r| FirewallRule {
                            port: r.port,
                            protocol: r.protocol,
                            comment: r.comment,
                            rate_limit: r.rate_limit,
                        })
                        .collect(),
                }),
                harden_docker: host.harden_docker,
            });
        }

        let networks = self
            .networks
            .into_iter()
            .map(|n| Network {
                name: n.name,
                host: n.host,
                driver: n.driver,
            })
            .collect();
        let volumes = self
            .volumes
            .into_iter()
            .map(|v| Volume {
                name: v.name,
                host: v.host,
                driver: v.driver,
            })
            .collect();

        let mut containers = Vec::with_capacity(self.containers.len());
        for c in self.containers {
            let volumes = c
                .volumes
                .iter()
                .filter_map(|entry| parse_volume_mount(entry))
                .collect();

            let mut mounts = Vec::new();
            let mut data_mounts = Vec::new();
            for file in c.files {
                match (file.source, file.content) {
                    (Some(source), None) => mounts.push(FileMount {
                        local_path: resolve_path(base_dir, &source),
                        container_path: file.target,
                        mode: file.mode,
                    }),
                    (None, Some(content)) => data_mounts.push(DataMount {
                        data: content.into_bytes(),
                        container_path: file.target,
                        mode: file.mode,
                    }),
                    // Rejected by validate().
                    _ => {}
                }
            }

            let tmpfs = c
                .tmpfs
                .into_iter()
                .map(|(mount_point, options)| (mount_point, harden_tmpfs_options(&options)))
                .collect();

            containers.push(Container {
                name: c.name,
                host: c.host,
                image: c.image,
                command: c.command,
                user: c.user,
                memory: c.memory,
                memory_reservation: c.memory_reservation,
                cpu_shares: c.cpu_shares,
                cpu_quota: c.cpu_quota,
                pids_limit: c.pids_limit,
                networks: c.networks,
                network_alias: c.network_alias,
                ports: c.ports,
                extra_hosts: c.extra_hosts,
                volumes,
                mounts,
                data_mounts,
                tmpfs,
                env_file: c.env_file.map(|p| resolve_path(base_dir, &p)),
                env: c.env,
                labels: c.labels,
                health_check: c.health_check.map(build_health_check),
                depends_on: c.depends_on,
                read_only: c.read_only,
                security_opts: c.security_opts,
                cap_add: c.cap_add,
                cap_drop: c.cap_drop,
                groups: c.groups,
                restart: c.restart,
            });
        }

        Ok(Plan {
            name: self.name,
            hosts,
            networks,
            volumes,
            containers,
        })
    }
}

fn check_firewall(endpoint: &str, fw: &FirewallSection, errors: &mut Vec<ValidationError>) {
    for policy in [&fw.default_incoming, &fw.default_outgoing] {
        if !matches!(policy.as_str(), "allow" | "deny" | "reject") {
            errors.push(ValidationError::BadFirewall {
                host: endpoint.to_string(),
                reason: format!("default policy must be allow, deny, or reject, got `{policy}`"),
            });
        }
    }
    for rule in &fw.rules {
        if !matches!(rule.protocol.as_str(), "tcp" | "udp") {
            errors.push(ValidationError::BadFirewall {
                host: endpoint.to_string(),
                reason: format!("rule protocol must be tcp or udp, got `{}`", rule.protocol),
            });
        }
    }
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = Path::new(expanded.as_ref());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn parse_volume_mount(entry: &str) -> Option<VolumeMount> {
    let mut parts = entry.splitn(3, ':');
    let source = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let mode = parts.next().unwrap_or("").to_string();
    if source.is_empty() || !target.starts_with('/') {
        return None;
    }
    if !mode.is_empty() && mode != "ro" && mode != "rw" {
        return None;
    }
    Some(VolumeMount {
        source,
        target,
        mode,
    })
}

fn port_mapping_ok(port: &str) -> bool {
    let spec = port.split('/').next().unwrap_or(port);
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        // "8080:80" or "127.0.0.1:8080:80"
        [host_port, container_port] | [_, host_port, container_port] => {
            host_port.parse::<u16>().is_ok() && container_port.parse::<u16>().is_ok()
        }
        _ => false,
    }
}

/// tmpfs mounts always carry `noexec,nosuid,nodev`, whatever the plan says.
fn harden_tmpfs_options(options: &str) -> String {
    let mut parts: Vec<&str> = options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .collect();
    for required in ["noexec", "nosuid", "nodev"] {
        if !parts.contains(&required) {
            parts.push(required);
        }
    }
    parts.join(",")
}

fn check_health_config(hc: &HealthCheckConfig) -> Result<(), String> {
    match hc.kind.as_str() {
        "http" => {
            let path = hc.path.as_deref().unwrap_or("");
            if !path.starts_with('/') {
                return Err("http checks need a path starting with `/`".to_string());
            }
            if hc.port.is_none() {
                return Err("http checks need a port".to_string());
            }
        }
        "tcp" => {
            if hc.port.is_none() {
                return Err("tcp checks need a port".to_string());
            }
        }
        "command" => {
            if hc.command.is_empty() {
                return Err("command checks need a command".to_string());
            }
        }
        other => return Err(format!("unknown health check kind `{other}`")),
    }
    if hc.interval_secs == Some(0) {
        return Err("interval must be at least 1 second".to_string());
    }
    if hc.timeout_secs == Some(0) {
        return Err("timeout must be at least 1 second".to_string());
    }
    if hc.retries == Some(0) {
        return Err("retries must be at least 1".to_string());
    }
    Ok(())
}

fn build_health_check(hc: HealthCheckConfig) -> HealthCheck {
    let probe = match hc.kind.as_str() {
        "http" => Probe::Http {
            path: hc.path.unwrap_or_else(|| "/".to_string()),
            port: hc.port.unwrap_or(80),
        },
        "tcp" => Probe::Tcp {
            port: hc.port.unwrap_or(80),
        },
        _ => Probe::Command(hc.command),
    };
    let mut check = HealthCheck::new(probe);
    if let Some(secs) = hc.timeout_secs {
        check.timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = hc.interval_secs {
        check.interval = Duration::from_secs(secs);
    }
    if let Some(retries) = hc.retries {
        check.retries = retries;
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> PlanConfig {
        toml::from_str(toml_src).expect("plan should parse")
    }

    const MINIMAL: &str = r#"
        name = "prod"

        [[hosts]]
        endpoint = "deploy@10.0.0.5"

        [[networks]]
        name = "edge"
        host = "deploy@10.0.0.5"

        [[containers]]
        name = "web"
        host = "deploy@10.0.0.5"
        image = "nginx:1.27"
        networks = ["edge"]
    "#;

    #[test]
    fn minimal_plan_validates() {
        let config = parse(MINIMAL);
        assert!(config.validate().is_ok());
        assert_eq!(config.networks[0].driver, "bridge");
        assert_eq!(config.containers[0].restart, "unless-stopped");
    }

    #[test]
    fn unknown_host_reference_is_rejected() {
        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "web"
            host = "ghost"
            image = "nginx"
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::UnknownHost {
            kind: "container",
            name: "web".to_string(),
            host: "ghost".to_string(),
        }));
    }

    #[test]
    fn all_errors_are_reported_at_once() {
        let config = parse(
            r#"
            name = ""

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "web"
            host = "a"
            image = ""
            networks = ["missing"]
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyPlanName));
        assert!(errors.contains(&ValidationError::MissingImage {
            container: "web".to_string(),
        }));
        assert!(errors.contains(&ValidationError::UnknownNetwork {
            container: "web".to_string(),
            network: "missing".to_string(),
        }));
    }

    #[test]
    fn cross_host_dependency_is_rejected() {
        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[hosts]]
            endpoint = "b"

            [[containers]]
            name = "db"
            host = "a"
            image = "postgres"

            [[containers]]
            name = "web"
            host = "b"
            image = "nginx"
            depends_on = ["db"]
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::BadDependency {
            container: "web".to_string(),
            dependency: "db".to_string(),
        }));
    }

    #[test]
    fn dependency_cycle_is_rejected_with_members() {
        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "x"
            host = "a"
            image = "img"
            depends_on = ["y"]

            [[containers]]
            name = "y"
            host = "a"
            image = "img"
            depends_on = ["x"]
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::DependencyCycle { host, cycle }]
                if host == "a" && cycle.contains(&"x".to_string())
        ));
    }

    #[test]
    fn duplicate_container_name_on_same_host_is_rejected() {
        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "web"
            host = "a"
            image = "one"

            [[containers]]
            name = "web"
            host = "a"
            image = "two"
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateResource {
            kind: "container",
            name: "web".to_string(),
            host: "a".to_string(),
        }));
    }

    #[test]
    fn bad_health_checks_are_rejected() {
        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "web"
            host = "a"
            image = "nginx"

            [containers.health_check]
            kind = "http"
            path = "health"
            port = 80
            "#,
        );
        let errors = config.validate().unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::BadHealthCheck { container, .. }] if container == "web"
        ));
    }

    #[test]
    fn tmpfs_options_are_hardened() {
        assert_eq!(harden_tmpfs_options(""), "noexec,nosuid,nodev");
        assert_eq!(
            harden_tmpfs_options("size=64m"),
            "size=64m,noexec,nosuid,nodev"
        );
        assert_eq!(
            harden_tmpfs_options("noexec,nosuid,nodev"),
            "noexec,nosuid,nodev"
        );
    }

    #[test]
    fn volume_mount_parsing() {
        let mount = parse_volume_mount("data:/var/lib/pg:ro").expect("valid");
        assert_eq!(mount.source, "data");
        assert_eq!(mount.target, "/var/lib/pg");
        assert_eq!(mount.mode, "ro");

        assert!(parse_volume_mount("/host/path:/in/container").is_some());
        assert!(parse_volume_mount("data").is_none());
        assert!(parse_volume_mount("data:relative").is_none());
        assert!(parse_volume_mount("data:/x:badmode").is_none());
    }

    #[test]
    fn port_mappings() {
        assert!(port_mapping_ok("8080:80"));
        assert!(port_mapping_ok("443:443/tcp"));
        assert!(port_mapping_ok("127.0.0.1:5432:5432"));
        assert!(!port_mapping_ok("80"));
        assert!(!port_mapping_ok("web:80"));
    }

    #[test]
    fn into_plan_resolves_paths_and_inline_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("nginx.conf"), b"server {}").expect("write");

        let config = parse(
            r#"
            name = "prod"

            [[hosts]]
            endpoint = "a"

            [[containers]]
            name = "web"
            host = "a"
            image = "nginx"

            [[containers.files]]
            source = "nginx.conf"
            target = "/etc/nginx/nginx.conf"

            [[containers.files]]
            content = "upstream {}"
            target = "/etc/nginx/conf.d/up.conf"
            mode = "ro"

            [containers.tmpfs]
            "/tmp" = "size=64m"
            "#,
        );
        config.validate().expect("valid");
        let plan = config.into_plan(dir.path()).expect("plan builds");

        let container = &plan.containers[0];
        assert_eq!(container.mounts.len(), 1);
        assert_eq!(container.mounts[0].local_path, dir.path().join("nginx.conf"));
        assert_eq!(container.data_mounts.len(), 1);
        assert_eq!(container.data_mounts[0].data, b"upstream {}");
        assert_eq!(container.tmpfs["/tmp"], "size=64m,noexec,nosuid,nodev");
    }
}
