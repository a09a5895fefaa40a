use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Policy;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Manages per-library engines. Each library gets its own Engine, WAL,
/// hold sweeper and compactor. Library = the `library` field of a request.
pub struct LibraryManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: Policy,
    sweep_interval: Duration,
}

impl LibraryManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: Policy, sweep_interval: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            sweep_interval,
        }
    }

    /// Get or lazily open the engine for the given library.
    pub fn get_or_create(&self, library: &str) -> std::io::Result<Arc<Engine>> {
        if library.len() > MAX_LIBRARY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "library name too long",
            ));
        }

        // Sanitize to keep the WAL inside data_dir
        let safe_name: String = library
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty library name",
            ));
        }

        // Keyed by the sanitized name so "../x" and "x" share one engine.
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_LIBRARIES {
            return Err(std::io::Error::other("too many libraries"));
        }

        // Only one engine (and one WAL writer) may ever exist per library, so
        // the open happens under the entry's shard lock.
        let entry = self.engines.entry(safe_name.clone());
        if let Entry::Occupied(e) = &entry {
            return Ok(e.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.policy)?);

        let sweeper_engine = engine.clone();
        let every = self.sweep_interval;
        tokio::spawn(async move {
            sweeper::run_sweeper(sweeper_engine, every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            sweeper::run_compactor(compactor_engine, threshold).await;
        });

        entry.insert(engine.clone());
        // Gauge read happens after the shard lock is released.
        metrics::gauge!(crate::observability::LIBRARIES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened library {safe_name}");
        Ok(engine)
    }
}
