//! Conflict listing, history and pruning.

use super::{print_json, truncate, Context, Format};
use offsync_store::{ConflictFilter, LocalStore};

/// Runs the conflicts command.
pub fn list(ctx: &Context, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = if all {
        ConflictFilter::all()
    } else {
        ConflictFilter::open()
    };
    let mut conflicts = ctx.store.list_conflicts(&filter)?;
    conflicts.sort_by_key(|c| c.detected_at);

    if ctx.format == Format::Json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<16}  {:<10}  {:<25}  {}",
        "ID", "KIND", "ENTITY", "TYPE", "DETECTED", "RESOLUTION"
    );
    for conflict in &conflicts {
        let resolution = conflict
            .resolution
            .as_ref()
            .map_or_else(|| "open".to_string(), |choice| choice.to_string());
        println!(
            "{:<36}  {:<16}  {:<16}  {:<10}  {:<25}  {}",
            conflict.id,
            truncate(&conflict.entity_kind, 16),
            truncate(&conflict.entity_id, 16),
            format!("{:?}", conflict.conflict_type),
            conflict.detected_at.to_rfc3339(),
            resolution,
        );
    }
    println!();
    println!("{} conflict(s)", conflicts.len());

    Ok(())
}

/// Runs the history command.
pub fn history(ctx: &Context, kind: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = ctx.resolver()?;
    let records = resolver.history(kind)?;
    let stats = resolver.strategy_stats(kind)?;

    if ctx.format == Format::Json {
        return print_json(&serde_json::json!({
            "resolutions": records,
            "strategies": stats,
        }));
    }
    if records.is_empty() {
        println!("No resolutions recorded");
        return Ok(());
    }

    for record in &records {
        let how = match (&record.strategy, record.automatic) {
            (Some(strategy), true) => format!("auto ({strategy})"),
            _ => "manual".to_string(),
        };
        println!(
            "{}  {}/{}  {}  {}  [{}]",
            record.resolved_at.to_rfc3339(),
            record.entity_kind,
            record.entity_id,
            record.choice,
            how,
            record.severity,
        );
        if let Some(notes) = &record.notes {
            println!("    {notes}");
        }
    }

    println!();
    println!("Strategies:");
    for entry in &stats {
        println!(
            "  {:<24} {:>6}  {:>5.1}%",
            entry.strategy,
            entry.resolved,
            entry.share * 100.0
        );
    }

    Ok(())
}

/// Runs the prune command.
pub fn prune(ctx: &Context, days: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = ctx.resolver()?;
    let removed = match days {
        Some(days) => resolver.prune_before(ctx.now() - chrono::Duration::days(i64::from(days)))?,
        None => resolver.prune()?,
    };

    if ctx.format == Format::Json {
        return print_json(&serde_json::json!({ "removed": removed }));
    }
    println!("✓ Removed {removed} resolved conflict(s)");
    Ok(())
}
