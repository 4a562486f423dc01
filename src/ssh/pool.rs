//! Connection pool: at most one transport per host
//!
//! Reads take a shared lock so concurrent workers on different hosts never
//! contend once their connections exist. Creation double-checks under the
//! write lock, so two workers racing for the same endpoint still end up
//! sharing a single transport.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::plan::Host;

use super::{Connection, ConnectionSource, SshError};

pub struct ConnectionPool {
    source: Box<dyn ConnectionSource>,
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
}

impl ConnectionPool {
    pub fn new(source: Box<dyn ConnectionSource>) -> Self {
        Self {
            source,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get the connection for a host, establishing it on first use.
    pub fn get(&self, host: &Host) -> Result<Arc<dyn Connection>, SshError> {
        {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            if let Some(conn) = connections.get(&host.endpoint) {
                return Ok(Arc::clone(conn));
            }
        }

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        // Another worker may have connected while we waited for the lock.
        if let Some(conn) = connections.get(&host.endpoint) {
            return Ok(Arc::clone(conn));
        }

        let conn = self.source.connect(host)?;
        connections.insert(host.endpoint.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Close every pooled connection, aggregating failures. Connections are
    /// drained first, so a second call is a no-op.
    pub fn close_all(&self) -> Result<(), SshError> {
        let drained: Vec<(String, Arc<dyn Connection>)> = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.drain().collect()
        };

        let total = drained.len();
        let mut errors = Vec::new();
        for (endpoint, conn) in drained {
            if let Err(err) = conn.close() {
                errors.push(format!("{endpoint}: {err}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SshError::Close {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
