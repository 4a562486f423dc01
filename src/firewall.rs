//! Host firewall convergence via ufw
//!
//! Brings a host's ufw state to the declared configuration: installs ufw if
//! missing, aligns default policies, adds missing rules, recreates rules
//! whose rate-limit flag changed, deletes undeclared rules, and finally
//! enables the firewall. A host that already matches issues only read
//! commands.

use crate::packages;
use crate::plan::{FirewallConfig, FirewallRule};
use crate::remote::{Remote, RemoteCommand, RemoteError};

/// Converge one host's firewall to `config`.
pub fn converge(remote: &Remote, config: &FirewallConfig) -> Result<(), RemoteError> {
    packages::ensure_installed(remote, "ufw")?;

    let (current_in, current_out) = defaults(remote)?;
    if current_in != config.default_incoming || current_out != config.default_outgoing {
        set_defaults(remote, &config.default_incoming, &config.default_outgoing)?;
    }

    let current = rules(remote)?;

    for desired in &config.rules {
        match find_rule(&current, desired.port, &desired.protocol) {
            None => add_rule(remote, desired)?,
            Some(existing) if existing.rate_limit != desired.rate_limit => {
                remove_rule(remote, desired.port, &desired.protocol)?;
                add_rule(remote, desired)?;
            }
            Some(_) => {}
        }
    }

    for existing in &current {
        if find_rule(&config.rules, existing.port, &existing.protocol).is_none() {
            remove_rule(remote, existing.port, &existing.protocol)?;
        }
    }

    if !is_enabled(remote)? {
        enable(remote)?;
    }

    log::info!("[{}] firewall configuration complete", remote.host());
    Ok(())
}

fn is_enabled(remote: &Remote) -> Result<bool, RemoteError> {
    let output = remote.exec_ok(&RemoteCommand::new("ufw").arg("status").sudo())?;
    Ok(output.stdout.contains("Status: active"))
}

fn enable(remote: &Remote) -> Result<(), RemoteError> {
    remote.exec_ok(&RemoteCommand::new("ufw").args(["--force", "enable"]).sudo())?;
    log::info!("[{}] firewall enabled", remote.host());
    Ok(())
}

/// Current default policies as `(incoming, outgoing)`. Unreadable output is
/// reported as empty policies, which the caller treats as divergent.
fn defaults(remote: &Remote) -> Result<(String, String), RemoteError> {
    let output = remote.exec(&RemoteCommand::new("ufw").args(["status", "verbose"]).sudo())?;
    if !output.success() {
        return Ok((String::new(), String::new()));
    }

    // Example: "Default: deny (incoming), allow (outgoing), disabled (routed)"
    for line in output.stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("Default:") else {
            continue;
        };
        let mut incoming = String::new();
        let mut outgoing = String::new();
        for part in rest.split(',') {
            let part = part.trim();
            if let Some(policy) = part.strip_suffix("(incoming)") {
                incoming = policy.trim().to_string();
            } else if let Some(policy) = part.strip_suffix("(outgoing)") {
                outgoing = policy.trim().to_string();
            }
        }
        return Ok((incoming, outgoing));
    }
    Ok((String::new(), String::new()))
}

fn set_defaults(remote: &Remote, incoming: &str, outgoing: &str) -> Result<(), RemoteError> {
    remote.exec_ok(&RemoteCommand::new("ufw").args(["default", incoming, "incoming"]).sudo())?;
    remote.exec_ok(&RemoteCommand::new("ufw").args(["default", outgoing, "outgoing"]).sudo())?;
    log::info!(
        "[{}] firewall defaults set to {incoming} incoming, {outgoing} outgoing",
        remote.host()
    );
    Ok(())
}

/// Parse `ufw status numbered` into rules. Only simple `PORT/PROTO` ALLOW
/// and LIMIT entries are managed; anything else is left untouched.
fn rules(remote: &Remote) -> Result<Vec<FirewallRule>, RemoteError> {
    let output = remote.exec_ok(&RemoteCommand::new("ufw").args(["status", "numbered"]).sudo())?;

    let mut parsed = Vec::new();
    // Example: "[ 1] 22/tcp   LIMIT IN   Anywhere   # SSH"
    for line in output.stdout.lines() {
        let Some(close) = line.find(']') else {
            continue;
        };
        let rest = &line[close + 1..];
        let comment = rest
            .split_once('#')
            .map(|(_, c)| c.trim().to_string())
            .unwrap_or_default();

        let mut fields = rest.split_whitespace();
        let Some(spec) = fields.next() else {
            continue;
        };
        let Some((port, protocol)) = spec.split_once('/') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if !matches!(protocol, "tcp" | "udp") {
            continue;
        }
        let action = fields.next().unwrap_or_default();
        if fields.next() != Some("IN") {
            continue;
        }
        let rate_limit = match action {
            "ALLOW" => false,
            "LIMIT" => true,
            _ => continue,
        };

        parsed.push(FirewallRule {
            port,
            protocol: protocol.to_string(),
            comment,
            rate_limit,
        });
    }
    Ok(parsed)
}

fn add_rule(remote: &Remote, rule: &FirewallRule) -> Result<(), RemoteError> {
    let action = if rule.rate_limit { "limit" } else { "allow" };
    let mut cmd = RemoteCommand::new("ufw")
        .arg(action)
        .arg(format!("{}/{}", rule.port, rule.protocol))
        .sudo();
    if !rule.comment.is_empty() {
        cmd = cmd.args(["comment", &rule.comment]);
    }
    remote.exec_ok(&cmd)?;
    log::info!(
        "[{}] firewall rule added: {action} {}/{}",
        remote.host(),
        rule.port,
        rule.protocol
    );
    Ok(())
}

fn remove_rule(remote: &Remote, port: u16, protocol: &str) -> Result<(), RemoteError> {
    // `delete` takes the original rule spelling; limit rules need `limit`.
    for action in ["allow", "limit"] {
        let cmd = RemoteCommand::new("ufw")
            .args(["delete", action])
            .arg(format!("{port}/{protocol}"))
            .sudo();
        if remote.exec(&cmd)?.success() {
            log::info!("[{}] firewall rule removed: {port}/{protocol}", remote.host());
            return Ok(());
        }
    }
    Err(RemoteError::Command {
        command: format!("ufw delete allow|limit {port}/{protocol}"),
        status: 1,
        stderr: "could not delete rule".to_string(),
    })
}

fn find_rule<'a>(rules: &'a [FirewallRule], port: u16, protocol: &str) -> Option<&'a FirewallRule> {
    rules
        .iter()
        .find(|r| r.port == port && r.protocol == protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedConnection;
    use std::sync::Arc;

    const STATUS_VERBOSE: &str = "\
Status: active

Default: deny (incoming), allow (outgoing), disabled (routed)
";

    const STATUS_NUMBERED: &str = "\
Status: active

     To                         Action      From
     --                         ------      ----
[ 1] 22/tcp                     LIMIT IN    Anywhere                   # SSH
[ 2] 443/tcp                    ALLOW IN    Anywhere
[ 3] 443/tcp (v6)               ALLOW IN    Anywhere (v6)
";

    fn remote(conn: &Arc<ScriptedConnection>) -> Remote {
        Remote::new(Arc::clone(conn) as _, "test-host")
    }

    fn config(rules: Vec<FirewallRule>) -> FirewallConfig {
        FirewallConfig {
            default_incoming: "deny".to_string(),
            default_outgoing: "allow".to_string(),
            rules,
        }
    }

    fn rule(port: u16, rate_limit: bool) -> FirewallRule {
        FirewallRule {
            port,
            protocol: "tcp".to_string(),
            comment: String::new(),
            rate_limit,
        }
    }

    fn scripted_converged() -> Arc<ScriptedConnection> {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("dpkg-query", "install ok installed");
        conn.respond("ufw status verbose", STATUS_VERBOSE);
        conn.respond("ufw status numbered", STATUS_NUMBERED);
        conn.respond("ufw status", STATUS_VERBOSE);
        conn
    }

    #[test]
    fn converged_host_gets_only_reads() {
        let conn = scripted_converged();
        let remote = remote(&conn);

        converge(&remote, &config(vec![rule(22, true), rule(443, false)])).expect("converge");

        assert!(!conn.ran("ufw default"));
        assert!(!conn.ran("ufw allow"));
        assert!(!conn.ran("ufw limit"));
        assert!(!conn.ran("ufw delete"));
        assert!(!conn.ran("ufw --force enable"));
    }

    #[test]
    fn missing_rule_is_added() {
        let conn = scripted_converged();
        let remote = remote(&conn);

        converge(
            &remote,
            &config(vec![rule(22, true), rule(443, false), rule(8080, false)]),
        )
        .expect("converge");
        assert!(conn.ran("sudo ufw allow 8080/tcp"));
    }

    #[test]
    fn undeclared_rule_is_deleted() {
        let conn = scripted_converged();
        let remote = remote(&conn);

        converge(&remote, &config(vec![rule(22, true)])).expect("converge");
        assert!(conn.ran("sudo ufw delete allow 443/tcp"));
    }

    #[test]
    fn changed_rate_limit_recreates_the_rule() {
        let conn = scripted_converged();
        let remote = remote(&conn);

        converge(&remote, &config(vec![rule(22, false), rule(443, false)])).expect("converge");
        assert!(conn.ran("sudo ufw delete limit 22/tcp") || conn.ran("sudo ufw delete allow 22/tcp"));
        assert!(conn.ran("sudo ufw allow 22/tcp"));
    }

    #[test]
    fn inactive_firewall_is_enabled() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("dpkg-query", "install ok installed");
        conn.respond("ufw status verbose", "Default: deny (incoming), allow (outgoing), disabled (routed)");
        conn.respond("ufw status numbered", "Status: inactive");
        conn.respond("ufw status", "Status: inactive");
        let remote = remote(&conn);

        converge(&remote, &config(vec![])).expect("converge");
        assert!(conn.ran("sudo ufw --force enable"));
    }

    #[test]
    fn status_parsing_extracts_managed_rules() {
        let conn = Arc::new(ScriptedConnection::new());
        conn.respond("ufw status numbered", STATUS_NUMBERED);
        let remote = remote(&conn);

        let parsed = rules(&remote).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].port, 22);
        assert!(parsed[0].rate_limit);
        assert_eq!(parsed[0].comment, "SSH");
        assert_eq!(parsed[1].port, 443);
        assert!(!parsed[1].rate_limit);
    }
}
