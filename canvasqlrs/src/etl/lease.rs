use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{CanvasqlError, Result};

static GLOBAL: Lazy<Arc<LeaseRegistry>> = Lazy::new(|| Arc::new(LeaseRegistry::default()));

/// In-process registry of connection names with an ETL lifecycle running.
/// A lease covers every `{connection}__*` table for the whole lifecycle.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    held: Mutex<HashSet<String>>,
}

impl LeaseRegistry {
    /// Registry shared by every engine in the process.
    pub fn global() -> Arc<LeaseRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Take the lease for `connection_name`, failing fast when it is held.
    pub fn acquire(self: &Arc<Self>, connection_name: &str) -> Result<LeaseGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(connection_name.to_string()) {
            return Err(CanvasqlError::EtlInProgress(connection_name.to_string()));
        }
        tracing::debug!(connection = %connection_name, "ETL lease acquired");
        Ok(LeaseGuard {
            registry: Arc::clone(self),
            connection_name: connection_name.to_string(),
        })
    }

    pub fn is_held(&self, connection_name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(connection_name)
    }
}

/// Releases its lease on drop, whether the lifecycle succeeded or not.
#[derive(Debug)]
pub struct LeaseGuard {
    registry: Arc<LeaseRegistry>,
    connection_name: String,
}

impl LeaseGuard {
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut held = self.registry.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.connection_name);
        tracing::debug!(connection = %self.connection_name, "ETL lease released");
    }
}
