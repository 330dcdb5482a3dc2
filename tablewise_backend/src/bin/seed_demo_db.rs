use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tablewise_backend::demo::{demo_tables, seed_sales_database};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sales.db"));

    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove existing database {:?}", path))?;
        tracing::info!("Removed existing database {:?}", path);
    }

    let conn = Connection::open(&path)
        .with_context(|| format!("Failed to create database {:?}", path))?;
    seed_sales_database(&conn)?;
    tracing::info!("Seeded demo sales database at {:?}", path);

    println!("Demo database ready: {}", path.display());
    println!("Register these tables with `tablewise configure`:");
    for table in demo_tables() {
        println!("  {}: {}", table.table_name, table.description);
    }
    Ok(())
}
