//! Health gating for new container instances
//!
//! A new instance is only promoted once its probe succeeds. Probes run from
//! the host (HTTP and TCP against the container's network address) or inside
//! the container (command probes), so the image needs no extra tooling for
//! the first two. Polling is bounded by both the retry count and the wall
//! clock timeout, whichever runs out first.

use std::thread;
use std::time::Instant;

use crate::docker::executor::DockerExecutor;
use crate::plan::{HealthCheck, Probe};

use super::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("container {container} did not become healthy after {attempts} attempts")]
    Unhealthy { container: String, attempts: u32 },
    #[error("health check cancelled")]
    Cancelled,
}

/// Poll `container` until its probe passes or the budget runs out.
///
/// Transport and inspect failures count as failed attempts rather than
/// aborting: a container that is still wiring up its network can make
/// `container inspect` report no address yet.
pub fn await_healthy(
    docker: &DockerExecutor,
    container: &str,
    network: Option<&str>,
    check: &HealthCheck,
    cancel: &CancelToken,
) -> Result<(), HealthError> {
    let deadline = Instant::now() + check.timeout;

    for attempt in 1..=check.retries {
        if cancel.is_cancelled() {
            return Err(HealthError::Cancelled);
        }

        if probe_once(docker, container, network, &check.probe) {
            log::debug!(
                "[{}] {container} healthy after {attempt} attempt(s)",
                docker.host()
            );
            return Ok(());
        }

        if attempt == check.retries || Instant::now() + check.interval >= deadline {
            break;
        }
        thread::sleep(check.interval);
    }

    Err(HealthError::Unhealthy {
        container: container.to_string(),
        attempts: check.retries,
    })
}

fn probe_once(
    docker: &DockerExecutor,
    container: &str,
    network: Option<&str>,
    probe: &Probe,
) -> bool {
    let result = match probe {
        Probe::Http { path, port } => network_probe(docker, container, network, |ip| {
            docker.probe_http(&ip, *port, path)
        }),
        Probe::Tcp { port } => {
            network_probe(docker, container, network, |ip| docker.probe_tcp(&ip, *port))
        }
        Probe::Command(argv) => docker
            .exec_in_container(container, argv)
            .map(|output| output.success()),
    };

    match result {
        Ok(healthy) => healthy,
        Err(err) => {
            log::debug!("[{}] probe of {container} failed: {err}", docker.host());
            false
        }
    }
}

fn network_probe(
    docker: &DockerExecutor,
    container: &str,
    network: Option<&str>,
    probe: impl FnOnce(String) -> Result<bool, crate::docker::DockerError>,
) -> Result<bool, crate::docker::DockerError> {
    let Some(network) = network else {
        log::warn!(
            "[{}] {container} has a network probe but no network, treating as unhealthy",
            docker.host()
        );
        return Ok(false);
    };
    let ip = docker.container_ip(container, network)?;
    probe(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Remote;
    use crate::testutil::ScriptedConnection;
    use std::sync::Arc;
    use std::time::Duration;

    fn executor(conn: &Arc<ScriptedConnection>) -> DockerExecutor {
        DockerExecutor::new(Remote::new(Arc::clone(conn) as _, "test-host"))
    }

    fn check(probe: Probe, retries: u32) -> HealthCheck {
        HealthCheck {
            probe,
            timeout: Duration::from_secs(30),
            interval: Duration::ZERO,
            retries,
        }
    }

    #[test]
    fn http_probe_passes_through_container_ip() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("container inspect", "172.18.0.5\n");
        let docker = executor(&conn);

        await_healthy(
            &docker,
            "web-g2",
            Some("edge"),
            &check(
                Probe::Http {
                    path: "/healthz".to_string(),
                    port: 8080,
                },
                3,
            ),
            &CancelToken::new(),
        )
        .expect("healthy");

        assert!(conn.ran("curl -fsS -o /dev/null --max-time 5 http://172.18.0.5:8080/healthz"));
    }

    #[test]
    fn failing_probe_exhausts_retries() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("container inspect", "172.18.0.5\n");
        conn.fail("curl", "connection refused", 7);
        let docker = executor(&conn);

        let err = await_healthy(
            &docker,
            "web-g2",
            Some("edge"),
            &check(
                Probe::Http {
                    path: "/".to_string(),
                    port: 80,
                },
                3,
            ),
            &CancelToken::new(),
        )
        .expect_err("unhealthy");

        match err {
            HealthError::Unhealthy { container, attempts } => {
                assert_eq!(container, "web-g2");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Unhealthy, got {other:?}"),
        }
        assert_eq!(conn.commands().iter().filter(|c| c.contains("curl")).count(), 3);
    }

    #[test]
    fn missing_ip_counts_as_a_failed_attempt() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("container inspect", "<no value>\n");
        let docker = executor(&conn);

        let err = await_healthy(
            &docker,
            "db-g1",
            Some("internal"),
            &check(Probe::Tcp { port: 5432 }, 2),
            &CancelToken::new(),
        )
        .expect_err("unhealthy");
        assert!(matches!(err, HealthError::Unhealthy { .. }));
    }

    #[test]
    fn command_probe_runs_inside_the_container() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);

        await_healthy(
            &docker,
            "db-g1",
            None,
            &check(
                Probe::Command(vec!["pg_isready".to_string(), "-q".to_string()]),
                3,
            ),
            &CancelToken::new(),
        )
        .expect("healthy");

        assert!(conn.ran("docker exec db-g1 pg_isready -q"));
    }

    #[test]
    fn cancellation_stops_polling_immediately() {
        let conn = Arc::new(ScriptedConnection::new());
        let docker = executor(&conn);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = await_healthy(
            &docker,
            "web-g1",
            Some("edge"),
            &check(Probe::Tcp { port: 80 }, 5),
            &cancel,
        )
        .expect_err("cancelled");
        assert!(matches!(err, HealthError::Cancelled));
        assert!(conn.commands().is_empty());
    }
}
