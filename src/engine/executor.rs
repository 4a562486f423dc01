//! Host convergence: decide per resource, then apply
//!
//! Each host is reconciled by its own worker; commands on a host run
//! strictly in order. A transport failure aborts the host's remaining work,
//! a single resource failure only fails that resource and its report entry.
//!
//! Containers are replaced without downtime: the new generation starts
//! alongside the old one under the same network alias, must pass its health
//! check, and only then are the old instances retired. A failed health
//! check removes the new instance and keeps the old one serving.

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

use reconcile::{
    ApplyOutcome, Decision, DependencyGraph, HostReport, ImageState, Observation, RunReport,
    RunSummary, StaleReason, decide,
};

use crate::docker::executor::{DockerExecutor, ImagePull, RunSpec};
use crate::docker::{self, DockerError, daemon};
use crate::firewall;
use crate::packages;
use crate::plan::{Container, Host, Network, Plan, Volume, VolumeMount};
use crate::remote::Remote;
use crate::ssh::pool::ConnectionPool;

use super::health::{self, HealthError};
use super::{CancelToken, ExecuteOptions};

#[derive(Debug, thiserror::Error)]
enum ResourceError {
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Health(#[from] HealthError),
}

impl ResourceError {
    fn is_host_fatal(&self) -> bool {
        matches!(self, Self::Docker(err) if err.is_host_fatal())
    }
}

/// Drives a whole plan against its hosts through a shared connection pool.
pub struct Engine<'a> {
    plan: &'a Plan,
    pool: &'a ConnectionPool,
}

impl<'a> Engine<'a> {
    pub fn new(plan: &'a Plan, pool: &'a ConnectionPool) -> Self {
        Self { plan, pool }
    }

    /// Converge every host to the plan. Hosts run in parallel and never
    /// block each other; the report keeps the plan's host order.
    pub fn deploy(&self, options: &ExecuteOptions) -> RunReport {
        let hosts = self
            .plan
            .hosts
            .par_iter()
            .map(|host| self.deploy_host(host, options))
            .collect();
        RunReport { hosts }
    }

    /// Tear down everything the plan owns, containers first, in reverse
    /// dependency order. Resources carrying another deployment's tracking
    /// label are left alone.
    pub fn destroy(&self, options: &ExecuteOptions) -> RunReport {
        let hosts = self
            .plan
            .hosts
            .par_iter()
            .map(|host| self.destroy_host(host, options))
            .collect();
        RunReport { hosts }
    }

    fn deploy_host(&self, host: &Host, options: &ExecuteOptions) -> HostReport {
        let mut report = HostReport {
            host: host.endpoint.clone(),
            summary: RunSummary::default(),
            error: None,
        };

        let docker = match self.connect(host) {
            Ok(docker) => docker,
            Err(err) => {
                report.error = Some(err);
                return report;
            }
        };

        if options.dry_run {
            log::info!("[{}] dry run, skipping host preparation", host.endpoint);
        } else if !options.cancel.is_cancelled()
            && let Err(err) = self.prepare_host(&docker, host)
        {
            report.error = Some(err);
            return report;
        }

        let mut cancelled = false;

        for network in self.plan.networks.iter().filter(|n| n.host == host.endpoint) {
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self
                .reconcile_network(&docker, network, options.dry_run)
                .map_err(ResourceError::from);
            if !apply(&mut report, result) {
                return report;
            }
        }

        for volume in self.plan.volumes.iter().filter(|v| v.host == host.endpoint) {
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self
                .reconcile_volume(&docker, volume, options.dry_run)
                .map_err(ResourceError::from);
            if !apply(&mut report, result) {
                return report;
            }
        }

        let Some((graph, by_name)) = self.container_graph(host, &mut report) else {
            return report;
        };
        let order = match graph.creation_order() {
            Ok(order) => order,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };
        for idx in order {
            let Some(container) = by_name.get(graph.name(idx)) else {
                continue;
            };
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self.reconcile_container(&docker, container, options);
            if !apply(&mut report, result) {
                return report;
            }
        }

        // A cancelled host must not read as converged.
        if cancelled && report.error.is_none() {
            report.error = Some("cancelled before the host converged".to_string());
        }
        report
    }

    fn destroy_host(&self, host: &Host, options: &ExecuteOptions) -> HostReport {
        let mut report = HostReport {
            host: host.endpoint.clone(),
            summary: RunSummary::default(),
            error: None,
        };

        let docker = match self.connect(host) {
            Ok(docker) => docker,
            Err(err) => {
                report.error = Some(err);
                return report;
            }
        };

        let mut cancelled = false;

        let Some((graph, by_name)) = self.container_graph(host, &mut report) else {
            return report;
        };
        let order = match graph.teardown_order() {
            Ok(order) => order,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };
        for idx in order {
            let Some(container) = by_name.get(graph.name(idx)) else {
                continue;
            };
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self
                .teardown_container(&docker, container, options.dry_run)
                .map_err(ResourceError::from);
            if !apply(&mut report, result) {
                return report;
            }
        }

        for volume in self.plan.volumes.iter().filter(|v| v.host == host.endpoint) {
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self
                .teardown_volume(&docker, volume, options.dry_run)
                .map_err(ResourceError::from);
            if !apply(&mut report, result) {
                return report;
            }
        }

        for network in self.plan.networks.iter().filter(|n| n.host == host.endpoint) {
            if options.cancel.is_cancelled() {
                cancelled = true;
                record_cancelled(&mut report);
                continue;
            }
            let result = self
                .teardown_network(&docker, network, options.dry_run)
                .map_err(ResourceError::from);
            if !apply(&mut report, result) {
                return report;
            }
        }

        if cancelled && report.error.is_none() {
            report.error = Some("cancelled before the host converged".to_string());
        }
        report
    }

    fn connect(&self, host: &Host) -> Result<DockerExecutor, String> {
        let conn = self
            .pool
            .get(host)
            .map_err(|err| format!("connection failed: {err}"))?;
        Ok(DockerExecutor::new(Remote::new(conn, &host.endpoint)))
    }

    /// Package set, automatic updates, daemon hardening, firewall, registry
    /// logins. Any failure here aborts the host: nothing deployed on a
    /// half-prepared machine is trustworthy.
    fn prepare_host(&self, docker: &DockerExecutor, host: &Host) -> Result<(), String> {
        let as_message = |err: &dyn std::fmt::Display| format!("host preparation failed: {err}");

        let remote = docker.remote();
        for package in &host.packages {
            packages::ensure_installed(remote, package).map_err(|e| as_message(&e))?;
        }
        for package in &host.remove_packages {
            packages::ensure_removed(remote, package).map_err(|e| as_message(&e))?;
        }
        packages::ensure_auto_updates(remote).map_err(|e| as_message(&e))?;

        if host.harden_docker {
            daemon::ensure_hardened(remote).map_err(|e| as_message(&e))?;
        }
        if let Some(config) = &host.firewall {
            firewall::converge(remote, config).map_err(|e| as_message(&e))?;
        }
        for credential in &host.registries {
            docker.registry_login(credential).map_err(|e| as_message(&e))?;
        }
        Ok(())
    }

    fn container_graph<'p>(
        &'p self,
        host: &Host,
        report: &mut HostReport,
    ) -> Option<(DependencyGraph, HashMap<&'p str, &'p Container>)> {
        let containers: Vec<&Container> = self
            .plan
            .containers
            .iter()
            .filter(|c| c.host == host.endpoint)
            .collect();
        let nodes: Vec<(String, Vec<String>)> = containers
            .iter()
            .map(|c| (c.name.clone(), c.depends_on.clone()))
            .collect();

        match DependencyGraph::build(&nodes) {
            Ok(graph) => {
                let by_name = containers.iter().map(|c| (c.name.as_str(), *c)).collect();
                Some((graph, by_name))
            }
            Err(err) => {
                report.error = Some(err.to_string());
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Networks and volumes
    // ------------------------------------------------------------------

    fn reconcile_network(
        &self,
        docker: &DockerExecutor,
        network: &Network,
        dry_run: bool,
    ) -> Result<ApplyOutcome, DockerError> {
        let desired = network.config_hash();
        let exists = docker.network_exists(&network.name)?;
        let recorded = if exists {
            self.read_recorded(
                docker.network_label(&network.name, docker::LABEL_CONFIG_HASH),
                &network.name,
                docker,
            )?
        } else {
            None
        };

        let decision = decide(
            &Observation {
                exists,
                recorded_hash: recorded,
            },
            &desired,
            ImageState::NotPulled,
        );
        if dry_run {
            return Ok(dry_run_outcome(decision, "network", &network.name));
        }

        match decision {
            Decision::Skip => Ok(ApplyOutcome::Unchanged),
            Decision::Create => {
                docker.create_network(&network.name, &network.driver, &self.tracking_labels(&desired))?;
                Ok(ApplyOutcome::Created)
            }
            Decision::Replace(reason) => {
                log::info!(
                    "[{}] replacing network {}: {}",
                    docker.host(),
                    network.name,
                    reason_text(reason)
                );
                docker.remove_network(&network.name)?;
                docker.create_network(&network.name, &network.driver, &self.tracking_labels(&desired))?;
                Ok(ApplyOutcome::Replaced)
            }
        }
    }

    fn reconcile_volume(
        &self,
        docker: &DockerExecutor,
        volume: &Volume,
        dry_run: bool,
    ) -> Result<ApplyOutcome, DockerError> {
        let desired = volume.config_hash();
        let exists = docker.volume_exists(&volume.name)?;
        let recorded = if exists {
            self.read_recorded(
                docker.volume_label(&volume.name, docker::LABEL_CONFIG_HASH),
                &volume.name,
                docker,
            )?
        } else {
            None
        };

        let decision = decide(
            &Observation {
                exists,
                recorded_hash: recorded,
            },
            &desired,
            ImageState::NotPulled,
        );
        if dry_run {
            return Ok(dry_run_outcome(decision, "volume", &volume.name));
        }

        match decision {
            Decision::Skip => Ok(ApplyOutcome::Unchanged),
            Decision::Create => {
                docker.create_volume(&volume.name, &volume.driver, &self.tracking_labels(&desired))?;
                Ok(ApplyOutcome::Created)
            }
            Decision::Replace(reason) => {
                // Replacing a volume discards its data; only a driver change
                // can get here and that is already destructive.
                log::warn!(
                    "[{}] replacing volume {}: {}",
                    docker.host(),
                    volume.name,
                    reason_text(reason)
                );
                docker.remove_volume(&volume.name)?;
                docker.create_volume(&volume.name, &volume.driver, &self.tracking_labels(&desired))?;
                Ok(ApplyOutcome::Replaced)
            }
        }
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    fn reconcile_container(
        &self,
        docker: &DockerExecutor,
        container: &Container,
        options: &ExecuteOptions,
    ) -> Result<ApplyOutcome, ResourceError> {
        let desired = container.config_hash();
        let instances = docker.instances_of(&container.name)?;
        let recorded = match newest_instance(&container.name, &instances) {
            Some(instance) => self.read_recorded(
                docker.container_label(instance, docker::LABEL_CONFIG_HASH),
                instance,
                docker,
            )?,
            None => None,
        };

        let image = if options.dry_run {
            ImageState::NotPulled
        } else {
            match docker.pull_image(&container.image)? {
                ImagePull::Fresh => ImageState::Fresh,
                ImagePull::UpToDate => ImageState::UpToDate,
            }
        };

        let decision = decide(
            &Observation {
                exists: !instances.is_empty(),
                recorded_hash: recorded,
            },
            &desired,
            image,
        );
        if options.dry_run {
            return Ok(dry_run_outcome(decision, "container", &container.name));
        }

        match decision {
            Decision::Skip => Ok(ApplyOutcome::Unchanged),
            Decision::Create => {
                let generation = next_generation(&container.name, &instances);
                self.start_instance(docker, container, &desired, generation, &options.cancel)?;
                Ok(ApplyOutcome::Created)
            }
            Decision::Replace(reason) => {
                log::info!(
                    "[{}] replacing {}: {}",
                    docker.host(),
                    container.name,
                    reason_text(reason)
                );
                let generation = next_generation(&container.name, &instances);
                self.start_instance(docker, container, &desired, generation, &options.cancel)?;

                // The new generation is healthy; retire the old ones.
                for old in &instances {
                    docker.stop_container(old)?;
                    docker.remove_container(old, true)?;
                }
                Ok(ApplyOutcome::Replaced)
            }
        }
    }

    /// Start one generation of a container and gate on its health check.
    /// On any failure after `docker run` the instance is removed again, so
    /// a broken deployment never leaves a half-wired container behind.
    fn start_instance(
        &self,
        docker: &DockerExecutor,
        container: &Container,
        desired_hash: &str,
        generation: u64,
        cancel: &CancelToken,
    ) -> Result<String, ResourceError> {
        let instance = format!("{}-g{generation}", container.name);
        let spec = self.build_run_spec(docker, container, &instance, desired_hash, generation)?;
        docker.run_container(&spec)?;

        if let Err(err) = self.finish_instance(docker, container, &instance, cancel) {
            if let Err(rm_err) = docker.remove_container(&instance, true) {
                log::warn!(
                    "[{}] failed to clean up unhealthy instance {instance}: {rm_err}",
                    docker.host()
                );
            }
            return Err(err);
        }
        Ok(instance)
    }

    fn finish_instance(
        &self,
        docker: &DockerExecutor,
        container: &Container,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<(), ResourceError> {
        let alias = alias_for(container);
        for network in container.networks.iter().skip(1) {
            docker.connect_network(instance, network, alias)?;
        }

        if let Some(check) = &container.health_check {
            health::await_healthy(
                docker,
                instance,
                container.networks.first().map(String::as_str),
                check,
                cancel,
            )?;
        }
        Ok(())
    }

    fn build_run_spec(
        &self,
        docker: &DockerExecutor,
        container: &Container,
        instance: &str,
        desired_hash: &str,
        generation: u64,
    ) -> Result<RunSpec, DockerError> {
        let mut volumes = container.volumes.clone();
        for mount in &container.mounts {
            let source = docker.upload_mount(&mount.local_path)?;
            volumes.push(VolumeMount {
                source,
                target: mount.container_path.clone(),
                mode: mount.mode.clone(),
            });
        }
        for mount in &container.data_mounts {
            let source = docker.upload_data_mount(&mount.data)?;
            volumes.push(VolumeMount {
                source,
                target: mount.container_path.clone(),
                mode: mount.mode.clone(),
            });
        }

        let mut env_files = Vec::new();
        if let Some(path) = &container.env_file {
            env_files.push(docker.upload_env_file(path)?);
        }
        if let Some(path) = docker.upload_env_vars(&container.env)? {
            env_files.push(path);
        }

        let mut labels = container.labels.clone();
        labels.insert(docker::LABEL_CONFIG_HASH.to_string(), desired_hash.to_string());
        labels.insert(docker::LABEL_PLAN.to_string(), self.plan.name.clone());
        labels.insert(docker::LABEL_SERVICE.to_string(), container.name.clone());
        labels.insert(docker::LABEL_GENERATION.to_string(), generation.to_string());

        Ok(RunSpec {
            name: instance.to_string(),
            image: container.image.clone(),
            command: container.command.clone(),
            user: container.user.clone(),
            memory: container.memory.clone(),
            memory_reservation: container.memory_reservation.clone(),
            cpu_shares: container.cpu_shares,
            cpu_quota: container.cpu_quota,
            pids_limit: container.pids_limit,
            network: container.networks.first().cloned(),
            network_alias: alias_for(container).map(str::to_string),
            ports: container.ports.clone(),
            extra_hosts: container.extra_hosts.clone(),
            volumes,
            tmpfs: container.tmpfs.clone(),
            env_files,
            restart: container.restart.clone(),
            read_only: container.read_only,
            security_opts: container.security_opts.clone(),
            cap_add: container.cap_add.clone(),
            cap_drop: container.cap_drop.clone(),
            groups: container.groups.clone(),
            labels,
        })
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown_container(
        &self,
        docker: &DockerExecutor,
        container: &Container,
        dry_run: bool,
    ) -> Result<ApplyOutcome, DockerError> {
        let instances = docker.instances_of(&container.name)?;
        if instances.is_empty() {
            return Ok(ApplyOutcome::Unchanged);
        }
        if dry_run {
            return Ok(ApplyOutcome::Skipped {
                reason: format!(
                    "dry run: would remove {} instance(s) of {}",
                    instances.len(),
                    container.name
                ),
            });
        }

        let mut removed = 0;
        for instance in &instances {
            let owner = self.read_recorded(
                docker.container_label(instance, docker::LABEL_PLAN),
                instance,
                docker,
            )?;
            if owner.as_deref() != Some(self.plan.name.as_str()) {
                log::warn!(
                    "[{}] {instance} is not managed by {}, leaving it",
                    docker.host(),
                    self.plan.name
                );
                continue;
            }
            docker.stop_container(instance)?;
            docker.remove_container(instance, true)?;
            removed += 1;
        }

        if removed > 0 {
            Ok(ApplyOutcome::Removed)
        } else {
            Ok(ApplyOutcome::Skipped {
                reason: "owned by another deployment".to_string(),
            })
        }
    }

    fn teardown_network(
        &self,
        docker: &DockerExecutor,
        network: &Network,
        dry_run: bool,
    ) -> Result<ApplyOutcome, DockerError> {
        if !docker.network_exists(&network.name)? {
            return Ok(ApplyOutcome::Unchanged);
        }
        let owner = self.read_recorded(
            docker.network_label(&network.name, docker::LABEL_PLAN),
            &network.name,
            docker,
        )?;
        if owner.as_deref() != Some(self.plan.name.as_str()) {
            return Ok(ApplyOutcome::Skipped {
                reason: "owned by another deployment".to_string(),
            });
        }
        if dry_run {
            return Ok(ApplyOutcome::Skipped {
                reason: format!("dry run: would remove network {}", network.name),
            });
        }
        docker.remove_network(&network.name)?;
        Ok(ApplyOutcome::Removed)
    }

    fn teardown_volume(
        &self,
        docker: &DockerExecutor,
        volume: &Volume,
        dry_run: bool,
    ) -> Result<ApplyOutcome, DockerError> {
        if !docker.volume_exists(&volume.name)? {
            return Ok(ApplyOutcome::Unchanged);
        }
        let owner = self.read_recorded(
            docker.volume_label(&volume.name, docker::LABEL_PLAN),
            &volume.name,
            docker,
        )?;
        if owner.as_deref() != Some(self.plan.name.as_str()) {
            return Ok(ApplyOutcome::Skipped {
                reason: "owned by another deployment".to_string(),
            });
        }
        if dry_run {
            return Ok(ApplyOutcome::Skipped {
                reason: format!("dry run: would remove volume {}", volume.name),
            });
        }
        docker.remove_volume(&volume.name)?;
        Ok(ApplyOutcome::Removed)
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn tracking_labels(&self, config_hash: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(docker::LABEL_CONFIG_HASH.to_string(), config_hash.to_string());
        labels.insert(docker::LABEL_PLAN.to_string(), self.plan.name.clone());
        labels
    }

    /// A label that cannot be read makes the resource stale, not the run
    /// broken, unless the transport itself died.
    fn read_recorded(
        &self,
        result: Result<Option<String>, DockerError>,
        name: &str,
        docker: &DockerExecutor,
    ) -> Result<Option<String>, DockerError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_host_fatal() => Err(err),
            Err(err) => {
                log::warn!(
                    "[{}] could not read tracking label on {name}, treating as stale: {err}",
                    docker.host()
                );
                Ok(None)
            }
        }
    }
}

/// Record an outcome; returns `false` when the host must be abandoned.
fn apply(report: &mut HostReport, result: Result<ApplyOutcome, ResourceError>) -> bool {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(ResourceError::Health(HealthError::Cancelled)) => ApplyOutcome::Skipped {
            reason: "cancelled".to_string(),
        },
        Err(err) if err.is_host_fatal() => {
            report.error = Some(err.to_string());
            return false;
        }
        Err(err) => ApplyOutcome::Failed {
            error: err.to_string(),
        },
    };
    report.summary.record(&outcome);
    true
}

fn record_cancelled(report: &mut HostReport) {
    report.summary.record(&ApplyOutcome::Skipped {
        reason: "cancelled".to_string(),
    });
}

fn dry_run_outcome(decision: Decision, kind: &str, name: &str) -> ApplyOutcome {
    match decision {
        Decision::Skip => ApplyOutcome::Unchanged,
        Decision::Create => ApplyOutcome::Skipped {
            reason: format!("dry run: would create {kind} {name}"),
        },
        Decision::Replace(reason) => ApplyOutcome::Skipped {
            reason: format!("dry run: would replace {kind} {name} ({})", reason_text(reason)),
        },
    }
}

fn reason_text(reason: StaleReason) -> &'static str {
    match reason {
        StaleReason::HashChanged => "configuration changed",
        StaleReason::LabelUnreadable => "tracking label unreadable",
        StaleReason::ImageUpdated => "newer image available",
    }
}

/// The network alias instances answer to. Stable across generations so a
/// replacement takes over the old instance's name on the network; defaults
/// to the service name.
fn alias_for(container: &Container) -> Option<&str> {
    if container.networks.is_empty() {
        None
    } else {
        Some(container.network_alias.as_deref().unwrap_or(&container.name))
    }
}

fn generation_of(service: &str, instance: &str) -> Option<u64> {
    instance
        .strip_prefix(service)?
        .strip_prefix("-g")?
        .parse()
        .ok()
}

fn next_generation(service: &str, instances: &[String]) -> u64 {
    instances
        .iter()
        .filter_map(|i| generation_of(service, i))
        .max()
        .map_or(1, |max| max + 1)
}

/// The instance carrying the highest generation number; its label is the
/// authoritative record of what is currently deployed.
fn newest_instance<'i>(service: &str, instances: &'i [String]) -> Option<&'i String> {
    instances
        .iter()
        .max_by_key(|i| generation_of(service, i).unwrap_or(0))
}
