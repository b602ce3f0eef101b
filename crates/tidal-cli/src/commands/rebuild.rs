//! Rebuild command: drop and recreate the table.

use anyhow::{bail, Result};
use tidal_core::Config;
use tracing::info;

/// Drop the configured table and recreate it empty.
///
/// Pipeline checkpoints are left alone: a running pipeline keeps reading
/// from where it stopped.
pub async fn run(config: Config, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!(
            "Rebuilding {} discards all of its data; pass --yes to confirm",
            config.table.qualified_name()
        );
    }

    let writer = super::table_writer(&config)?;
    let snapshot = writer.rebuild_table(&writer.record_schema()).await?;

    info!(
        table = %writer.ident(),
        version = snapshot.version,
        "Table rebuilt"
    );
    println!("Table {} rebuilt (version {})", writer.ident(), snapshot.version);
    Ok(())
}
