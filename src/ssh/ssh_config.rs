//! Endpoint resolution against `~/.ssh/config`
//!
//! An endpoint is whatever the plan says: `10.0.0.5`, `web-1`, or
//! `deploy@web-1`. The alias (the part after any `user@` prefix) is matched
//! against `Host` blocks in the user's SSH config to pick up `Hostname`,
//! `User`, and `Port`. Precedence for the user: explicit `user@` prefix,
//! then the config, then `$USER`, then `root`.

use std::fs;

pub const DEFAULT_PORT: u16 = 22;

/// Connection parameters after resolving an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub user: String,
    pub hostname: String,
    pub port: u16,
}

/// Resolve an endpoint using the default `~/.ssh/config`, if present.
pub fn resolve(endpoint: &str) -> Resolved {
    let config = dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .filter(|p| p.exists())
        .and_then(|p| fs::read_to_string(p).ok())
        .unwrap_or_default();
    resolve_with(endpoint, &config)
}

/// Resolve an endpoint against the given SSH config text.
pub fn resolve_with(endpoint: &str, config: &str) -> Resolved {
    let (prefix_user, alias) = match endpoint.split_once('@') {
        Some((user, host)) => (Some(user.to_string()), host.to_string()),
        None => (None, endpoint.to_string()),
    };

    let block = lookup(config, &alias);

    let user = prefix_user
        .or_else(|| block.as_ref().and_then(|b| b.user.clone()))
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| "root".to_string());

    let hostname = block
        .as_ref()
        .and_then(|b| b.hostname.clone())
        .unwrap_or(alias);

    let port = block
        .as_ref()
        .and_then(|b| b.port)
        .unwrap_or(DEFAULT_PORT);

    Resolved {
        user,
        hostname,
        port,
    }
}

#[derive(Debug, Default)]
struct HostBlock {
    user: Option<String>,
    hostname: Option<String>,
    port: Option<u16>,
}

/// Find the first `Host` block whose pattern matches the alias. Only exact
/// names and the `*` wildcard suffix are honored, which covers the patterns
/// deployment configs actually use.
fn lookup(config: &str, alias: &str) -> Option<HostBlock> {
    let mut current: Option<HostBlock> = None;
    let mut matched = false;

    for raw in config.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => continue,
        };

        if key.eq_ignore_ascii_case("Host") {
            if matched {
                // First matching block wins.
                break;
            }
            matched = value.split_whitespace().any(|pat| pattern_matches(pat, alias));
            current = matched.then(HostBlock::default);
            continue;
        }

        let Some(block) = current.as_mut() else {
            continue;
        };
        if key.eq_ignore_ascii_case("User") {
            block.user = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("Hostname") {
            block.hostname = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("Port") {
            block.port = value.parse().ok();
        }
    }

    current
}

fn pattern_matches(pattern: &str, alias: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => alias.starts_with(prefix),
        None => pattern == alias,
    }
}

/// Path to the user's known_hosts file, if it exists.
pub fn known_hosts_path() -> Option<std::path::PathBuf> {
    let path = dirs::home_dir()?.join(".ssh").join("known_hosts");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
# deployment hosts
Host web-1
    Hostname 203.0.113.10
    User deploy
    Port 2222

Host db-*
    User postgres

Host *
    User fallback
";

    #[test]
    fn alias_resolves_hostname_user_and_port() {
        let resolved = resolve_with("web-1", CONFIG);
        assert_eq!(
            resolved,
            Resolved {
                user: "deploy".to_string(),
                hostname: "203.0.113.10".to_string(),
                port: 2222,
            }
        );
    }

    #[test]
    fn user_prefix_beats_config_user() {
        let resolved = resolve_with("admin@web-1", CONFIG);
        assert_eq!(resolved.user, "admin");
        assert_eq!(resolved.hostname, "203.0.113.10");
        assert_eq!(resolved.port, 2222);
    }

    #[test]
    fn wildcard_suffix_matches() {
        let resolved = resolve_with("db-primary", CONFIG);
        assert_eq!(resolved.user, "postgres");
        assert_eq!(resolved.hostname, "db-primary");
        assert_eq!(resolved.port, DEFAULT_PORT);
    }

    #[test]
    fn unknown_alias_falls_back_to_star_block() {
        let resolved = resolve_with("unlisted", CONFIG);
        assert_eq!(resolved.user, "fallback");
        assert_eq!(resolved.hostname, "unlisted");
    }

    #[test]
    fn empty_config_keeps_endpoint_as_hostname() {
        let resolved = resolve_with("deploy@198.51.100.7", "");
        assert_eq!(resolved.user, "deploy");
        assert_eq!(resolved.hostname, "198.51.100.7");
        assert_eq!(resolved.port, DEFAULT_PORT);
    }
}
