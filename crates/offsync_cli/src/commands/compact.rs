//! Compact command implementation.

use super::{print_json, Context, Format};

/// Runs the compact command.
pub fn run(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let report = ctx.store.compact()?;

    if ctx.format == Format::Json {
        return print_json(&serde_json::json!({
            "bytesBefore": report.bytes_before,
            "bytesAfter": report.bytes_after,
        }));
    }

    let saved = report.bytes_before.saturating_sub(report.bytes_after);
    println!("✓ Compacted {}", ctx.store.path().display());
    println!("  Before: {} bytes", report.bytes_before);
    println!("  After:  {} bytes", report.bytes_after);
    println!("  Saved:  {saved} bytes");
    Ok(())
}
