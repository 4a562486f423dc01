//! Debian package management over the remote transport
//!
//! Converges the host's installed package set: anything listed is installed
//! if missing, anything on the removal list is purged if present. Presence
//! is probed with `dpkg-query`, so a converged host issues no apt commands
//! at all. Automatic security updates are configured on every prepared host.

use crate::remote::{Remote, RemoteCommand, RemoteError};

const AUTO_UPGRADES_CONFIG: &str = "/etc/apt/apt.conf.d/20auto-upgrades";
const UNATTENDED_UPGRADES: &str = "unattended-upgrades";

/// Whether a package is currently installed.
pub fn is_installed(remote: &Remote, package: &str) -> Result<bool, RemoteError> {
    let cmd = RemoteCommand::new("dpkg-query")
        .args(["-W", "-f", "${Status}"])
        .arg(package);
    let output = remote.exec(&cmd)?;
    // dpkg-query exits nonzero for unknown packages; a removed-but-known
    // package reports a status other than "install ok installed".
    Ok(output.success() && output.stdout.contains("install ok installed"))
}

/// Install a package with apt, non-interactively and without recommends.
pub fn install(remote: &Remote, package: &str) -> Result<(), RemoteError> {
    remote.exec_ok(
        &RemoteCommand::new("apt-get")
            .args(["update", "-qq"])
            .sudo(),
    )?;
    remote.exec_ok(
        &RemoteCommand::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(["install", "-y", "-qq", "--no-install-recommends"])
            .arg(package)
            .sudo(),
    )?;
    log::info!("[{}] installed {package}", remote.host());
    Ok(())
}

/// Remove a package and autoremove its now-unused dependencies.
pub fn remove(remote: &Remote, package: &str) -> Result<(), RemoteError> {
    remote.exec_ok(
        &RemoteCommand::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(["remove", "-y", "-qq"])
            .arg(package)
            .sudo(),
    )?;
    remote.exec_ok(
        &RemoteCommand::new("apt-get")
            .args(["autoremove", "-y", "-qq"])
            .sudo(),
    )?;
    log::info!("[{}] removed {package}", remote.host());
    Ok(())
}

pub fn ensure_installed(remote: &Remote, package: &str) -> Result<(), RemoteError> {
    if is_installed(remote, package)? {
        log::debug!("[{}] {package} already installed", remote.host());
        return Ok(());
    }
    install(remote, package)
}

pub fn ensure_removed(remote: &Remote, package: &str) -> Result<(), RemoteError> {
    if !is_installed(remote, package)? {
        return Ok(());
    }
    remove(remote, package)
}

/// Whether unattended security upgrades are installed and switched on.
pub fn auto_updates_configured(remote: &Remote) -> Result<bool, RemoteError> {
    if !is_installed(remote, UNATTENDED_UPGRADES)? {
        return Ok(false);
    }

    let exists = remote
        .exec(&RemoteCommand::new("test").args(["-f", AUTO_UPGRADES_CONFIG]))?
        .success();
    if !exists {
        return Ok(false);
    }

    for setting in [
        "APT::Periodic::Update-Package-Lists \"1\"",
        "APT::Periodic::Unattended-Upgrade \"1\"",
    ] {
        let check = remote.exec(
            &RemoteCommand::new("grep")
                .arg("-q")
                .arg(setting)
                .arg(AUTO_UPGRADES_CONFIG),
        )?;
        if !check.success() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Install and enable unattended security upgrades. A no-op when already
/// configured.
pub fn ensure_auto_updates(remote: &Remote) -> Result<(), RemoteError> {
    if auto_updates_configured(remote)? {
        log::debug!("[{}] automatic updates already configured", remote.host());
        return Ok(());
    }

    ensure_installed(remote, UNATTENDED_UPGRADES)?;
    remote.exec_ok(
        &RemoteCommand::new("dpkg-reconfigure")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(["-plow", UNATTENDED_UPGRADES])
            .sudo(),
    )?;
    log::info!("[{}] automatic security updates enabled", remote.host());
    Ok(())
}
