//! Connection handle binding programs to a storage engine.

use std::fmt;
use std::sync::Arc;

use qvm_error::Result;
use qvm_storage::{MemStorage, StorageEngine};

use crate::ProgramBuilder;
use crate::config::VdbeConfig;

/// A live handle on a storage engine. Cloning is cheap; every clone and
/// every VM built from it share the same engine.
#[derive(Clone)]
pub struct Connection {
    engine: Arc<dyn StorageEngine>,
    config: VdbeConfig,
}

impl Connection {
    /// Connect to a fresh [`MemStorage`].
    pub fn open_in_memory() -> Self {
        Self::with_engine(Arc::new(MemStorage::new()))
    }

    pub fn with_engine(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            config: VdbeConfig::default(),
        }
    }

    /// Replace the configuration inherited by programs built from now on.
    #[must_use]
    pub fn with_config(mut self, config: VdbeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &VdbeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Start assembling a program against this connection.
    pub fn new_program(&self) -> ProgramBuilder {
        ProgramBuilder::new(self)
    }

    /// Create an empty rowid table and return its root.
    pub fn create_table(&self) -> Result<u32> {
        self.engine.create_table()
    }

    /// Create an empty index and return its root.
    pub fn create_index(&self) -> Result<u32> {
        self.engine.create_index()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_engine() {
        let conn = Connection::open_in_memory();
        let other = conn.clone();
        let a = conn.create_table().unwrap();
        let b = other.create_table().unwrap();
        assert_ne!(a, b);
        assert!(Arc::ptr_eq(conn.engine(), other.engine()));
    }

    #[test]
    fn test_config_inherited_by_builder() {
        let cfg = VdbeConfig::default().with_max_steps(Some(3));
        let conn = Connection::open_in_memory().with_config(cfg.clone());
        assert_eq!(conn.new_program().config(), &cfg);
    }
}
