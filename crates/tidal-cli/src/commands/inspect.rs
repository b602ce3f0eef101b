//! Inspect command: statistics of the table's current snapshot.

use anyhow::Result;
use tidal_core::table::{TableIdent, TableReader, TableStatistics};
use tidal_core::Config;

/// Print verification statistics for the configured table.
pub async fn run(config: Config, json: bool) -> Result<()> {
    let ident = TableIdent::new(config.table.namespace.clone(), config.table.table_name.clone());
    let reader = TableReader::new(super::table_store(&config)?, ident.clone());

    let Some(stats) = reader.statistics().await? else {
        println!("Table {} does not exist", ident);
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_statistics(&ident.to_string(), &stats);
    }
    Ok(())
}

fn print_statistics(table: &str, stats: &TableStatistics) {
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    println!("Table {} (version {})", table, stats.version);
    println!("  Total records:    {}", stats.total_records);
    println!("  Distinct ids:     {}", stats.distinct_ids);
    println!(
        "  Average value:    {}",
        or_dash(stats.avg_value.map(|v| format!("{:.2}", v)))
    );
    println!(
        "  Earliest event:   {}",
        or_dash(stats.earliest_event.map(|t| t.to_rfc3339()))
    );
    println!(
        "  Latest event:     {}",
        or_dash(stats.latest_event.map(|t| t.to_rfc3339()))
    );
    println!(
        "  First processed:  {}",
        or_dash(stats.first_processing.map(|t| t.to_rfc3339()))
    );
    println!(
        "  Last processed:   {}",
        or_dash(stats.last_processing.map(|t| t.to_rfc3339()))
    );
}
