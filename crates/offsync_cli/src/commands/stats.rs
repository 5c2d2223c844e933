//! Stats command implementation.

use super::{print_json, Context, Format};
use chrono::{DateTime, Utc};
use offsync_engine::{QueueStats, ALL_KINDS};
use offsync_store::LocalStore;
use serde::Serialize;

/// Everything the stats command reports.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalStats {
    /// Queue counters.
    pub queue: QueueStats,
    /// Last sync time per synced kind; `None` if never synced.
    pub last_sync: Vec<(String, Option<DateTime<Utc>>)>,
    /// Conflicts waiting for a decision.
    pub open_conflicts: usize,
    /// Resolution history entries.
    pub resolutions: usize,
    /// Journal size in bytes.
    pub journal_bytes: u64,
}

/// Collects the stats.
pub fn collect(ctx: &Context) -> Result<JournalStats, Box<dyn std::error::Error>> {
    let queue = ctx.queue()?;
    let resolver = ctx.resolver()?;
    let device = ctx.device_config()?;

    let kinds: Vec<String> = if device.supported_entity_kinds.is_empty() {
        vec![ALL_KINDS.to_string()]
    } else {
        device.supported_entity_kinds.clone()
    };
    let mut last_sync = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let at = ctx.store.get_last_sync_time(&kind)?;
        last_sync.push((kind, at));
    }

    Ok(JournalStats {
        queue: queue.stats(),
        last_sync,
        open_conflicts: resolver.open_conflicts()?.len(),
        resolutions: resolver.history(None)?.len(),
        journal_bytes: ctx.store.journal_size()?,
    })
}

/// Runs the stats command.
pub fn run(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let stats = collect(ctx)?;
    if ctx.format == Format::Json {
        return print_json(&stats);
    }

    println!("Journal: {}", ctx.store.path().display());
    println!("  Size: {} bytes", stats.journal_bytes);
    println!();
    println!("Queue:");
    println!("  Pending:    {}", stats.queue.pending);
    println!("  Processing: {}", stats.queue.processing);
    println!("  Failed:     {}", stats.queue.failed);
    println!("  Total:      {}", stats.queue.total);
    if let Some(oldest) = stats.queue.oldest_pending {
        println!("  Oldest pending: {}", oldest.to_rfc3339());
    }
    println!();
    println!("Last sync:");
    for (kind, at) in &stats.last_sync {
        let at = at.map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        println!("  {kind:<20} {at}");
    }
    println!();
    println!("Conflicts:");
    println!("  Open:        {}", stats.open_conflicts);
    println!("  Resolutions: {}", stats.resolutions);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_engine::DEVICE_CONFIG_META_KEY;
    use offsync_protocol::{DeviceConfig, NewOperation};
    use offsync_testkit::{customer, start_time, TempStore};

    #[test]
    fn counts_queue_and_sync_times() {
        let temp = TempStore::new();
        {
            let store = temp.open();
            let mut device = DeviceConfig::defaults_for("pos-1");
            device.supported_entity_kinds = vec!["Customer".into(), "Product".into()];
            store
                .set_meta(DEVICE_CONFIG_META_KEY, serde_json::to_value(&device).unwrap())
                .unwrap();
            store.set_last_sync_time("Customer", start_time()).unwrap();
            store
                .append_operation(
                    NewOperation::create("Customer", "1", customer("Ada", "ada@example.com"))
                        .into_operation(start_time()),
                )
                .unwrap();
        }

        let ctx = Context::open(&temp.path(), None, Format::Json).unwrap();
        let stats = collect(&ctx).unwrap();

        assert_eq!(stats.queue.pending, 1);
        assert_eq!(
            stats.last_sync,
            vec![
                ("Customer".to_string(), Some(start_time())),
                ("Product".to_string(), None),
            ]
        );
        assert_eq!(stats.open_conflicts, 0);
    }
}
