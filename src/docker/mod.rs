//! Remote Docker operations
//!
//! Everything here goes through the structured
//! [`RemoteCommand`](crate::remote::RemoteCommand) builder and a pooled
//! connection; nothing shells out locally. Existence probes read exit
//! statuses instead of parsing output, and uploads are content-addressed so
//! repeated runs transfer nothing that is already on the host.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

pub mod daemon;
pub mod executor;

/// Label recording the configuration hash a resource was created from.
pub const LABEL_CONFIG_HASH: &str = "caravel.config-hash";
/// Label recording which plan owns a resource.
pub const LABEL_PLAN: &str = "caravel.plan";
/// Label naming the logical service a container instance belongs to.
pub const LABEL_SERVICE: &str = "caravel.service";
/// Label carrying the numeric generation of a container instance.
pub const LABEL_GENERATION: &str = "caravel.generation";

/// Remote directory for content-addressed uploads.
pub const FILES_DIR: &str = "/var/lib/caravel/files";

/// Owner read/write only, for secrets such as env files.
pub const PERM_SECRET_FILE: i32 = 0o600;
/// World-readable, for mounts container users must read.
pub const PERM_PUBLIC_FILE: i32 = 0o644;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A command succeeded but its output was not in the expected shape.
    #[error("could not parse {what} from `{output}`")]
    Parse { what: String, output: String },

    /// A local file needed for an upload could not be read.
    #[error("could not read {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DockerError {
    /// Whether this failure should abort the whole host.
    pub fn is_host_fatal(&self) -> bool {
        matches!(self, Self::Remote(remote) if remote.is_host_fatal())
    }
}
