//! Database statistics and health overview.
//!
//! Used by `cred stats` to show what is stored: document count, embedding
//! count, documents still waiting for an embedding, and the feed
//! checkpoint.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use credence_core::index::SimilarityIndex;
use credence_core::store::RecordStore;

use crate::app::App;
use crate::config::Config;
use crate::ingest::FEED_SOURCE;

#[derive(Debug, Serialize)]
pub struct Stats {
    pub documents: u64,
    pub embeddings: usize,
    pub missing_embeddings: u64,
    pub checkpoint: Option<String>,
    pub checkpoint_updated_at: Option<i64>,
    pub db_bytes: u64,
}

pub async fn collect_stats(app: &App) -> Result<Stats> {
    let checkpoint = sqlx::query("SELECT cursor, updated_at FROM checkpoints WHERE source = ?")
        .bind(FEED_SOURCE)
        .fetch_optional(&app.pool)
        .await?;

    Ok(Stats {
        documents: app.store.count().await?,
        embeddings: app.index.embedding_count().await?,
        missing_embeddings: app.store.count_without_embeddings().await?,
        checkpoint: checkpoint.as_ref().map(|r| r.get("cursor")),
        checkpoint_updated_at: checkpoint.as_ref().map(|r| r.get("updated_at")),
        db_bytes: std::fs::metadata(&app.config.db.path)
            .map(|m| m.len())
            .unwrap_or(0),
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let app = App::open(config).await?;
    let stats = collect_stats(&app).await?;
    app.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Credence — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(stats.db_bytes));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Embeddings:  {}", stats.embeddings);
    println!("  Missing:     {}", stats.missing_embeddings);
    match (&stats.checkpoint, stats.checkpoint_updated_at) {
        (Some(cursor), Some(ts)) => {
            let when = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            println!("  Checkpoint:  {} ({})", cursor, when);
        }
        _ => println!("  Checkpoint:  none"),
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1_048_576), "5.0 MB");
    }
}
