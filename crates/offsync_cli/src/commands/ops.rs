//! Operation listing and retry.

use super::{print_json, truncate, Context, Format};
use offsync_engine::QueueItem;
use offsync_protocol::OperationStatus;

/// Returns queued operations in delivery order, optionally filtered.
pub fn collect(
    ctx: &Context,
    status: Option<OperationStatus>,
) -> Result<Vec<QueueItem>, Box<dyn std::error::Error>> {
    let items = ctx.queue()?.items();
    Ok(items
        .into_iter()
        .filter(|item| status.map_or(true, |s| item.operation.status == s))
        .collect())
}

/// Runs the ops command.
pub fn run(ctx: &Context, status: Option<OperationStatus>) -> Result<(), Box<dyn std::error::Error>> {
    let items = collect(ctx, status)?;
    if ctx.format == Format::Json {
        return print_json(&items);
    }

    if items.is_empty() {
        println!("No queued operations");
        return Ok(());
    }

    println!(
        "{:<36}  {:<6}  {:<16}  {:<16}  {:<10}  {:>8}  {}",
        "ID", "TYPE", "KIND", "ENTITY", "STATUS", "ATTEMPTS", "LAST ERROR"
    );
    for item in &items {
        let op = &item.operation;
        println!(
            "{:<36}  {:<6}  {:<16}  {:<16}  {:<10}  {:>8}  {}",
            op.id,
            op.op_type,
            truncate(&op.entity_kind, 16),
            truncate(&op.entity_id, 16),
            op.status,
            item.attempts,
            item.last_error.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!("{} operation(s)", items.len());

    Ok(())
}

/// Runs the retry-failed command.
pub fn retry_failed(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let count = ctx.queue()?.retry_failed()?;
    if ctx.format == Format::Json {
        return print_json(&serde_json::json!({ "requeued": count }));
    }
    if count == 0 {
        println!("No failed operations");
    } else {
        println!("✓ Requeued {count} operation(s)");
    }
    Ok(())
}
