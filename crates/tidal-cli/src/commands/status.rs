//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Health report served on `/health`.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    pipeline_state: String,
    components: BTreeMap<String, ComponentStatus>,
}

#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// Show health and metrics of a running pipeline.
pub async fn run(url: &str, metrics_url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the tidal pipeline running?");
            println!("Start it with: tidal ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", metrics_url.trim_end_matches('/'));
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn status_marker(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_marker(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!("Pipeline State: {}", health.pipeline_state);
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let marker = status_marker(&status.status);
            match &status.reason {
                Some(reason) => println!("  {} {}: {} ({})", marker, name, status.status, reason),
                None => println!("  {} {}: {}", marker, name, status.status),
            }
        }
    }
}

/// Parse Prometheus text format, summing labelled series per metric name.
fn parse_metrics(metrics_text: &str) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(series), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = series.split('{').next().unwrap_or(series);
        if let Ok(value) = value.parse::<f64>() {
            *values.entry(name.to_string()).or_insert(0.0) += value;
        }
    }

    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let rows = [
        ("tidal_messages_total", "Messages Polled:   "),
        ("tidal_records_dropped_total", "Records Dropped:   "),
        ("tidal_rows_written_total", "Rows Written:      "),
        ("tidal_batches_committed_total", "Batches Committed: "),
        ("tidal_replays_total", "Replayed Batches:  "),
        ("tidal_table_version", "Table Version:     "),
        ("tidal_source_lag", "Source Lag:        "),
        ("tidal_errors_total", "Errors:            "),
    ];
    for (metric, label) in rows {
        if let Some(v) = values.get(metric) {
            println!("{}{}", label, format_number(*v as u64));
        }
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
