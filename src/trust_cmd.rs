use anyhow::Result;
use tracing::info;

use credence_core::models::TrustDirection;
use credence_core::trust::{adjust_trust, TrustReport};

use crate::app::App;
use crate::config::Config;

/// `cred trust <id> --increase|--decrease`.
///
/// An unknown id fails with a not-found error and changes nothing.
pub async fn run_trust(config: &Config, id: &str, direction: TrustDirection, json: bool) -> Result<()> {
    let app = App::open(config).await?;
    let params = config.trust.params();
    let result = adjust_trust(app.store.as_ref(), app.index.as_ref(), id, direction, &params).await;
    app.close().await;
    let report = result?;

    info!(
        document_id = id,
        neighbors = report.neighbors.len(),
        failures = report.failures.len(),
        "trust adjusted"
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &TrustReport) {
    let verb = match report.direction {
        TrustDirection::Increase => "increase",
        TrustDirection::Decrease => "decrease",
    };
    println!("trust {}", verb);
    println!(
        "  {}: {:.4} -> {:.4}",
        report.primary.document_id, report.primary.before, report.primary.after
    );
    match &report.representative {
        Some(embedding_id) => println!("  representative embedding: {}", embedding_id),
        None => println!("  no embedding; nothing diffused"),
    }
    if !report.neighbors.is_empty() {
        println!("  neighbors:");
        for n in &report.neighbors {
            println!(
                "    {} [{:.3}]: {:.4} -> {:.4}",
                n.document_id,
                n.similarity.unwrap_or_default(),
                n.before,
                n.after
            );
        }
    }
    for f in &report.failures {
        println!("  failed: {}: {}", f.document_id, f.error);
    }
}
