use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::access::AccessGate;
use crate::calendar::CalendarSink;
use crate::clock::Clock;
use crate::engine::{Collaborators, Engine};
use crate::ledger::MemoryLedger;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sync;

/// Manages named booking registries — isolated namespaces of equipment and
/// reservations (a department, a site, a demo sandbox). Each registry gets
/// its own engine, WAL file and compactor; the access gate, calendar sink
/// and clock are shared across all of them.
pub struct RegistryManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    gate: Arc<dyn AccessGate>,
    calendar: Arc<dyn CalendarSink>,
    clock: Arc<dyn Clock>,
}

impl RegistryManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        gate: Arc<dyn AccessGate>,
        calendar: Arc<dyn CalendarSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            gate,
            calendar,
            clock,
        }
    }

    /// Get or lazily create the engine for the given registry.
    pub async fn get_or_create(&self, registry: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(registry) {
            return Ok(engine.value().clone());
        }
        if registry.len() > MAX_REGISTRY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "registry name too long",
            ));
        }
        if self.engines.len() >= MAX_REGISTRIES {
            return Err(std::io::Error::other("too many registries"));
        }

        // Sanitize the registry name to prevent path traversal
        let safe_name: String = registry
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty registry name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let collaborators = Collaborators {
            ledger: Arc::new(MemoryLedger::new()),
            gate: self.gate.clone(),
            calendar: self.calendar.clone(),
            clock: self.clock.clone(),
        };
        let engine = Arc::new(
            Engine::new(wal_path, Arc::new(NotifyHub::new()), collaborators).await?,
        );

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            sync::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(registry.to_string(), engine.clone());
        metrics::gauge!(crate::observability::REGISTRIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
