//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod ops;
pub mod stats;

use clap::ValueEnum;
use offsync_conflict::ConflictResolver;
use offsync_engine::{EngineConfig, OperationQueue, DEVICE_CONFIG_META_KEY};
use offsync_protocol::{Clock, DeviceConfig, SystemClock};
use offsync_store::{FileStore, LocalStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable tables.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// What every command works on.
pub struct Context {
    /// The opened journal.
    pub store: Arc<FileStore>,
    /// Engine configuration, defaults unless `--config` was given.
    pub config: EngineConfig,
    /// Output format.
    pub format: Format,
    clock: Arc<dyn Clock>,
}

impl Context {
    /// Opens the journal at `path`. Fails if an engine holds it.
    pub fn open(
        path: &Path,
        config: Option<&Path>,
        format: Format,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Err(format!("Journal not found: {}", path.display()).into());
        }
        debug!(path = %path.display(), "opening journal");
        let config = match config {
            Some(config) => EngineConfig::load(config)?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            store: Arc::new(FileStore::open(path)?),
            config,
            format,
            clock: Arc::new(SystemClock),
        })
    }

    /// Opens the operation queue over the journal.
    ///
    /// Operations left processing by a crashed engine are reset to pending.
    pub fn queue(&self) -> Result<OperationQueue, Box<dyn std::error::Error>> {
        Ok(OperationQueue::open(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.config.queue_retry.clone(),
        )?)
    }

    /// Builds a conflict resolver with the configured retention.
    pub fn resolver(&self) -> Result<ConflictResolver, Box<dyn std::error::Error>> {
        let retention = chrono::Duration::from_std(self.config.conflict_retention)?;
        Ok(ConflictResolver::new(self.store.clone(), Arc::clone(&self.clock)).with_retention(retention))
    }

    /// Device settings last served by the server, else the configured defaults.
    pub fn device_config(&self) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
        Ok(match self.store.get_meta(DEVICE_CONFIG_META_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => self.config.default_device_config.clone(),
        })
    }

    /// Returns the current time.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Shortens `text` to `width` characters for table cells.
pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("Customer", 10), "Customer");
        assert_eq!(truncate("ProductVariant", 8), "Product…");
    }
}
