//! Docker operations over an established connection
//!
//! One executor per host, wrapping that host's pooled connection. Existence
//! probes read exit statuses instead of parsing output; anything uploaded to
//! a host goes through content-addressed storage so repeated runs upload
//! nothing that is already there.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::hash;
use crate::plan::{RegistryCredential, VolumeMount};
use crate::remote::{Remote, RemoteCommand};
use crate::ssh::ExecOutput;

use super::{DockerError, FILES_DIR, PERM_PUBLIC_FILE, PERM_SECRET_FILE};

/// Result of a `docker pull`: did the registry hand us anything new?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePull {
    Fresh,
    UpToDate,
}

/// Everything `docker run` needs for one container instance. Built by the
/// engine after uploads have produced remote paths for every mount.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: Option<String>,
    pub memory: Option<String>,
    pub memory_reservation: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub pids_limit: Option<u64>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
    pub ports: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub tmpfs: BTreeMap<String, String>,
    pub env_files: Vec<String>,
    pub restart: String,
    pub read_only: bool,
    pub security_opts: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub groups: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

pub struct DockerExecutor {
    remote: Remote,
}

impl DockerExecutor {
    pub fn new(remote: Remote) -> Self {
        Self { remote }
    }

    pub fn host(&self) -> &str {
        self.remote.host()
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    fn run(&self, cmd: &RemoteCommand) -> Result<ExecOutput, DockerError> {
        Ok(self.remote.exec(cmd)?)
    }

    fn run_ok(&self, cmd: &RemoteCommand) -> Result<ExecOutput, DockerError> {
        Ok(self.remote.exec_ok(cmd)?)
    }

    // ------------------------------------------------------------------
    // Networks
    // ------------------------------------------------------------------

    pub fn network_exists(&self, name: &str) -> Result<bool, DockerError> {
        let output = self.run(&RemoteCommand::new("docker").args(["network", "inspect", name]))?;
        Ok(output.success())
    }

    pub fn create_network(
        &self,
        name: &str,
        driver: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DockerError> {
        let mut cmd = RemoteCommand::new("docker").args(["network", "create", "-d", driver]);
        for (key, value) in labels {
            cmd = cmd.arg("--label").arg(format!("{key}={value}"));
        }
        self.run_ok(&cmd.arg(name))?;
        log::info!("[{}] network {name} created", self.host());
        Ok(())
    }

    pub fn remove_network(&self, name: &str) -> Result<(), DockerError> {
        self.run_ok(&RemoteCommand::new("docker").args(["network", "rm", name]))?;
        log::info!("[{}] network {name} removed", self.host());
        Ok(())
    }

    pub fn network_label(&self, name: &str, key: &str) -> Result<Option<String>, DockerError> {
        self.read_label(&["network", "inspect"], name, &format!("{{{{index .Labels \"{key}\"}}}}"))
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    pub fn volume_exists(&self, name: &str) -> Result<bool, DockerError> {
        let output = self.run(&RemoteCommand::new("docker").args(["volume", "inspect", name]))?;
        Ok(output.success())
    }

    pub fn create_volume(
        &self,
        name: &str,
        driver: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DockerError> {
        let mut cmd = RemoteCommand::new("docker").args(["volume", "create", "--driver", driver]);
        for (key, value) in labels {
            cmd = cmd.arg("--label").arg(format!("{key}={value}"));
        }
        self.run_ok(&cmd.arg(name))?;
        log::info!("[{}] volume {name} created", self.host());
        Ok(())
    }

    pub fn remove_volume(&self, name: &str) -> Result<(), DockerError> {
        self.run_ok(&RemoteCommand::new("docker").args(["volume", "rm", name]))?;
        log::info!("[{}] volume {name} removed", self.host());
        Ok(())
    }

    pub fn volume_label(&self, name: &str, key: &str) -> Result<Option<String>, DockerError> {
        self.read_label(&["volume", "inspect"], name, &format!("{{{{index .Labels \"{key}\"}}}}"))
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// All container instances (running or not) belonging to a logical
    /// service, by instance name.
    pub fn instances_of(&self, service: &str) -> Result<Vec<String>, DockerError> {
        let output = self.run_ok(
            &RemoteCommand::new("docker")
                .args(["ps", "-a", "--filter"])
                .arg(format!("label={}={service}", super::LABEL_SERVICE))
                .args(["--format", "{{.Names}}"]),
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn container_label(&self, name: &str, key: &str) -> Result<Option<String>, DockerError> {
        self.read_label(
            &["container", "inspect"],
            name,
            &format!("{{{{index .Config.Labels \"{key}\"}}}}"),
        )
    }

    /// Pull an image and report whether anything new came down. Docker's
    /// `Status:` line distinguishes the two; an unrecognizable status is
    /// treated as fresh so a possibly-updated image is never skipped.
    pub fn pull_image(&self, image: &str) -> Result<ImagePull, DockerError> {
        let output = self.run_ok(&RemoteCommand::new("docker").args(["pull", image]))?;
        if output.stdout.contains("Status: Image is up to date") {
            log::debug!("[{}] image {image} already up to date", self.host());
            return Ok(ImagePull::UpToDate);
        }
        if output.stdout.contains("Status: Downloaded newer image") {
            log::info!("[{}] pulled newer image {image}", self.host());
            return Ok(ImagePull::Fresh);
        }
        log::warn!(
            "[{}] could not tell whether {image} was updated, assuming it was",
            self.host()
        );
        Ok(ImagePull::Fresh)
    }

    /// `docker login` with the password fed over stdin, never on the
    /// command line.
    pub fn registry_login(&self, credential: &RegistryCredential) -> Result<(), DockerError> {
        let cmd = RemoteCommand::new("docker")
            .args(["login", "-u", &credential.username, "--password-stdin"])
            .arg(&credential.registry)
            .stdin(credential.password.as_bytes().to_vec());
        self.run_ok(&cmd)?;
        log::info!(
            "[{}] logged into {} as {}",
            self.host(),
            credential.registry,
            credential.username
        );
        Ok(())
    }

    pub fn run_container(&self, spec: &RunSpec) -> Result<(), DockerError> {
        let mut cmd = RemoteCommand::new("docker")
            .args(["run", "-d", "--name", &spec.name]);

        if let Some(user) = &spec.user {
            cmd = cmd.args(["--user", user]);
        }
        for group in &spec.groups {
            cmd = cmd.args(["--group-add", group]);
        }
        if let Some(memory) = &spec.memory {
            cmd = cmd.args(["--memory", memory]);
        }
        if let Some(reservation) = &spec.memory_reservation {
            cmd = cmd.args(["--memory-reservation", reservation]);
        }
        if let Some(shares) = spec.cpu_shares {
            cmd = cmd.arg("--cpu-shares").arg(shares.to_string());
        }
        if let Some(quota) = spec.cpu_quota {
            cmd = cmd.arg("--cpu-quota").arg(quota.to_string());
        }
        if let Some(limit) = spec.pids_limit {
            cmd = cmd.arg("--pids-limit").arg(limit.to_string());
        }
        if let Some(network) = &spec.network {
            cmd = cmd.args(["--network", network]);
        }
        if let Some(alias) = &spec.network_alias {
            cmd = cmd.args(["--network-alias", alias]);
        }
        for port in &spec.ports {
            cmd = cmd.args(["-p", port]);
        }
        for extra_host in &spec.extra_hosts {
            cmd = cmd.args(["--add-host", extra_host]);
        }
        for mount in &spec.volumes {
            let mut entry = format!("{}:{}", mount.source, mount.target);
            if !mount.mode.is_empty() {
                entry.push(':');
                entry.push_str(&mount.mode);
            }
            cmd = cmd.arg("-v").arg(entry);
        }
        for (mount_point, options) in &spec.tmpfs {
            let entry = if options.is_empty() {
                mount_point.clone()
            } else {
                format!("{mount_point}:{options}")
            };
            cmd = cmd.arg("--tmpfs").arg(entry);
        }
        for env_file in &spec.env_files {
            cmd = cmd.args(["--env-file", env_file]);
        }
        if !spec.restart.is_empty() {
            cmd = cmd.args(["--restart", &spec.restart]);
        }
        if spec.read_only {
            cmd = cmd.arg("--read-only");
        }
        for opt in &spec.security_opts {
            cmd = cmd.args(["--security-opt", opt]);
        }
        for cap in &spec.cap_drop {
            cmd = cmd.args(["--cap-drop", cap]);
        }
        for cap in &spec.cap_add {
            cmd = cmd.args(["--cap-add", cap]);
        }
        for (key, value) in &spec.labels {
            cmd = cmd.arg("--label").arg(format!("{key}={value}"));
        }

        cmd = cmd.arg(&spec.image);
        for arg in &spec.command {
            cmd = cmd.arg(arg);
        }

        let output = self.run_ok(&cmd)?;
        log::info!(
            "[{}] container {} started ({})",
            self.host(),
            spec.name,
            output.stdout_trimmed()
        );
        Ok(())
    }

    /// Attach a running container to an additional network.
    pub fn connect_network(
        &self,
        container: &str,
        network: &str,
        alias: Option<&str>,
    ) -> Result<(), DockerError> {
        let mut cmd = RemoteCommand::new("docker").args(["network", "connect"]);
        if let Some(alias) = alias {
            cmd = cmd.args(["--alias", alias]);
        }
        self.run_ok(&cmd.arg(network).arg(container))?;
        Ok(())
    }

    pub fn stop_container(&self, name: &str) -> Result<(), DockerError> {
        self.run_ok(&RemoteCommand::new("docker").args(["stop", name]))?;
        log::info!("[{}] container {name} stopped", self.host());
        Ok(())
    }

    pub fn remove_container(&self, name: &str, force: bool) -> Result<(), DockerError> {
        let mut cmd = RemoteCommand::new("docker").arg("rm");
        if force {
            cmd = cmd.arg("-f");
        }
        self.run_ok(&cmd.arg(name))?;
        log::info!("[{}] container {name} removed", self.host());
        Ok(())
    }

    /// The container's IP address on a specific network, for health probes.
    pub fn container_ip(&self, name: &str, network: &str) -> Result<String, DockerError> {
        let format = format!("{{{{(index .NetworkSettings.Networks \"{network}\").IPAddress}}}}");
        let output = self.run_ok(
            &RemoteCommand::new("docker").args(["container", "inspect", "-f", &format, name]),
        )?;
        let ip = output.stdout_trimmed().to_string();
        if ip.is_empty() || ip == "<no value>" {
            return Err(DockerError::Parse {
                what: format!("IP address of {name} on {network}"),
                output: output.stdout,
            });
        }
        Ok(ip)
    }

    /// Run a command inside a container; used by command health probes. A
    /// nonzero exit is returned as output, not an error.
    pub fn exec_in_container(
        &self,
        name: &str,
        argv: &[String],
    ) -> Result<ExecOutput, DockerError> {
        let cmd = RemoteCommand::new("docker")
            .args(["exec", name])
            .args(argv.iter().cloned());
        self.run(&cmd)
    }

    /// Probe the host's network path to a container port without needing
    /// any tooling inside the container.
    pub fn probe_http(&self, ip: &str, port: u16, path: &str) -> Result<bool, DockerError> {
        let url = format!("http://{ip}:{port}{path}");
        let cmd = RemoteCommand::new("curl").args(["-fsS", "-o", "/dev/null", "--max-time", "5", &url]);
        Ok(self.run(&cmd)?.success())
    }

    pub fn probe_tcp(&self, ip: &str, port: u16) -> Result<bool, DockerError> {
        let script = format!("exec 3<>/dev/tcp/{ip}/{port}");
        let cmd = RemoteCommand::new("timeout").args(["5", "bash", "-c", &script]);
        Ok(self.run(&cmd)?.success())
    }

    // ------------------------------------------------------------------
    // Content-addressed uploads
    // ------------------------------------------------------------------

    /// Upload bytes to `/var/lib/caravel/files/<sha256>` unless they are
    /// already there. Returns the remote path.
    pub fn upload_content(&self, data: &[u8], mode: i32) -> Result<String, DockerError> {
        let remote_path = format!("{FILES_DIR}/{}", hash::bytes(data));

        let check = self.run(&RemoteCommand::new("test").args(["-f", &remote_path]))?;
        if check.success() {
            log::debug!("[{}] {remote_path} already present", self.host());
            return Ok(remote_path);
        }

        self.run_ok(&RemoteCommand::new("mkdir").args(["-p", FILES_DIR]))?;
        self.remote.upload(data, &remote_path, mode)?;
        log::debug!("[{}] uploaded {} bytes to {remote_path}", self.host(), data.len());
        Ok(remote_path)
    }

    /// Upload a local file or directory mount, returning the remote path to
    /// bind into the container. Directories land under their tree hash;
    /// already-present content is skipped entirely.
    pub fn upload_mount(&self, local_path: &Path) -> Result<String, DockerError> {
        let local_err = |source| DockerError::Local {
            path: local_path.to_path_buf(),
            source,
        };

        if local_path.is_dir() {
            let tree_hash = hash::dir_tree(local_path).map_err(local_err)?;
            let remote_root = format!("{FILES_DIR}/{tree_hash}");

            let check = self.run(&RemoteCommand::new("test").args(["-e", &remote_root]))?;
            if check.success() {
                log::debug!("[{}] {remote_root} already present", self.host());
                return Ok(remote_root);
            }

            self.upload_directory(local_path, &remote_root)?;
            return Ok(remote_root);
        }

        let data = fs::read(local_path).map_err(local_err)?;
        self.upload_content(&data, PERM_PUBLIC_FILE)
    }

    /// Upload raw bytes destined for a bind mount. World-readable so
    /// non-root container users can read them.
    pub fn upload_data_mount(&self, data: &[u8]) -> Result<String, DockerError> {
        self.upload_content(data, PERM_PUBLIC_FILE)
    }

    /// Upload a local env file as a secret.
    pub fn upload_env_file(&self, local_path: &Path) -> Result<String, DockerError> {
        let data = fs::read(local_path).map_err(|source| DockerError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        self.upload_content(&data, PERM_SECRET_FILE)
    }

    /// Render env vars to `KEY=VALUE` lines and upload as a secret file.
    /// Returns `None` when there is nothing to upload.
    pub fn upload_env_vars(
        &self,
        env: &BTreeMap<String, String>,
    ) -> Result<Option<String>, DockerError> {
        if env.is_empty() {
            return Ok(None);
        }
        let mut content = String::new();
        for (key, value) in env {
            // --env-file takes values verbatim; literal newlines would break
            // the format, so they become the two characters `\n`.
            content.push_str(key);
            content.push('=');
            content.push_str(&value.replace('\n', "\\n"));
            content.push('\n');
        }
        self.upload_content(content.as_bytes(), PERM_SECRET_FILE)
            .map(Some)
    }

    fn upload_directory(&self, local_root: &Path, remote_root: &str) -> Result<(), DockerError> {
        for entry in WalkDir::new(local_root).sort_by_file_name() {
            let entry = entry.map_err(|err| DockerError::Local {
                path: local_root.to_path_buf(),
                source: std::io::Error::other(err),
            })?;
            let rel = entry
                .path()
                .strip_prefix(local_root)
                .map_err(|err| DockerError::Local {
                    path: entry.path().to_path_buf(),
                    source: std::io::Error::other(err),
                })?;
            let remote_path = if rel.as_os_str().is_empty() {
                remote_root.to_string()
            } else {
                format!("{remote_root}/{}", rel.to_string_lossy())
            };

            if entry.file_type().is_dir() {
                self.run_ok(&RemoteCommand::new("mkdir").args(["-p", &remote_path]))?;
            } else {
                let data = fs::read(entry.path()).map_err(|source| DockerError::Local {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
                self.remote.upload(&data, &remote_path, PERM_PUBLIC_FILE)?;
            }
        }
        log::info!("[{}] uploaded directory tree to {remote_root}", self.host());
        Ok(())
    }

    fn read_label(
        &self,
        subcommand: &[&str],
        name: &str,
        format: &str,
    ) -> Result<Option<String>, DockerError> {
        let cmd = RemoteCommand::new("docker")
            .args(subcommand.iter().copied())
            .args(["-f", format, name]);
        let output = self.run_ok(&cmd)?;
        let value = output.stdout_trimmed();
        if value.is_empty() || value == "<no value>" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedConnection;

    fn executor(conn: &Arc<ScriptedConnection>) -> DockerExecutor {
        DockerExecutor::new(Remote::new(Arc::clone(conn) as _, "test-host"))
    }

    #[test]
    fn existence_probes_use_exit_status() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.fail("network inspect ghost", "no such network", 1);
        let docker = executor(&conn);

        assert!(docker.network_exists("edge").expect("probe"));
        assert!(!docker.network_exists("ghost").expect("probe"));
    }

    #[test]
    fn pull_image_distinguishes_fresh_from_up_to_date() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("pull nginx:old", "Status: Image is up to date for nginx:old");
        conn.respond("pull nginx:new", "Status: Downloaded newer image for nginx:new");
        let docker = executor(&conn);

        assert_eq!(docker.pull_image("nginx:old").expect("pull"), ImagePull::UpToDate);
        assert_eq!(docker.pull_image("nginx:new").expect("pull"), ImagePull::Fresh);
    }

    #[test]
    fn unparseable_pull_status_is_treated_as_fresh() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("pull weird", "some unexpected output");
        let docker = executor(&conn);

        assert_eq!(docker.pull_image("weird").expect("pull"), ImagePull::Fresh);
    }

    #[test]
    fn registry_password_travels_over_stdin_only() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);
        docker
            .registry_login(&RegistryCredential {
                registry: "ghcr.io".to_string(),
                username: "bot".to_string(),
                password: "s3cret".to_string(),
            })
            .expect("login");

        let execs = conn.execs.lock().expect("execs");
        let login = execs.iter().find(|e| e.command.contains("login")).expect("login ran");
        assert!(!login.command.contains("s3cret"));
        assert_eq!(login.stdin.as_deref(), Some(b"s3cret".as_slice()));
        assert!(login.command.contains("--password-stdin"));
    }

    #[test]
    fn upload_content_skips_bytes_already_on_the_host() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);

        // `test -f` succeeds by default, so the content is "present".
        let path = docker.upload_content(b"already there", PERM_SECRET_FILE).expect("upload");
        assert!(path.starts_with(FILES_DIR));
        assert_eq!(conn.upload_count(), 0);
    }

    #[test]
    fn upload_content_uploads_missing_bytes_with_mode() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.fail("test -f", "", 1);
        let docker = executor(&conn);

        let path = docker.upload_content(b"new bytes", PERM_SECRET_FILE).expect("upload");
        assert_eq!(path, format!("{FILES_DIR}/{}", hash::bytes(b"new bytes")));

        let uploads = conn.uploads.lock().expect("uploads");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, path);
        assert_eq!(uploads[0].mode, PERM_SECRET_FILE);
        assert!(conn.ran(&format!("mkdir -p {FILES_DIR}")));
    }

    #[test]
    fn env_vars_render_sorted_with_escaped_newlines() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.fail("test -f", "", 1);
        let docker = executor(&conn);

        let mut env = BTreeMap::new();
        env.insert("ZETA".to_string(), "multi\nline".to_string());
        env.insert("ALPHA".to_string(), "1".to_string());
        docker.upload_env_vars(&env).expect("upload");

        let uploads = conn.uploads.lock().expect("uploads");
        let content = String::from_utf8(uploads[0].data.clone()).expect("utf8");
        assert_eq!(content, "ALPHA=1\nZETA=multi\\nline\n");
        assert_eq!(uploads[0].mode, PERM_SECRET_FILE);
    }

    #[test]
    fn empty_env_uploads_nothing() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);
        assert!(docker.upload_env_vars(&BTreeMap::new()).expect("upload").is_none());
        assert_eq!(conn.upload_count(), 0);
    }

    #[test]
    fn run_container_renders_expected_flags() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);

        let mut labels = BTreeMap::new();
        labels.insert("caravel.plan".to_string(), "prod".to_string());
        let spec = RunSpec {
            name: "web-g3".to_string(),
            image: "nginx:1.27".to_string(),
            network: Some("edge".to_string()),
            network_alias: Some("web".to_string()),
            ports: vec!["443:443".to_string()],
            restart: "unless-stopped".to_string(),
            read_only: true,
            cap_drop: vec!["ALL".to_string()],
            labels,
            ..RunSpec::default()
        };
        docker.run_container(&spec).expect("run");

        let command = conn.commands().pop().expect("a command ran");
        assert!(command.starts_with("docker run -d --name web-g3"));
        assert!(command.contains("--network edge"));
        assert!(command.contains("--network-alias web"));
        assert!(command.contains("-p 443:443"));
        assert!(command.contains("--read-only"));
        assert!(command.contains("--cap-drop ALL"));
        assert!(command.contains("--label caravel.plan=prod"));
        assert!(command.ends_with("nginx:1.27"));
    }

    #[test]
    fn missing_label_reads_as_none() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("container inspect", "<no value>\n");
        let docker = executor(&conn);
        assert_eq!(docker.container_label("web-g1", "caravel.config-hash").expect("read"), None);
    }

    #[test]
    fn instances_are_parsed_per_line() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("docker ps -a", "web-g1\nweb-g2\n");
        let docker = executor(&conn);
        assert_eq!(
            docker.instances_of("web").expect("list"),
            vec!["web-g1".to_string(), "web-g2".to_string()]
        );
    }

    #[test]
    fn failing_command_surfaces_stderr() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.fail("volume rm", "volume is in use", 1);
        let docker = executor(&conn);

        match docker.remove_volume("data") {
            Err(DockerError::Remote(crate::remote::RemoteError::Command {
                status, stderr, ..
            })) => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "volume is in use");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }
}
