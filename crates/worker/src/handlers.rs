use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use stockflow::jobs::{parse_payload, HandlerOptions, HandlerRegistry, Job, JobError, ProgressReporter};

// Demo handlers. Real deployments register their own types on the scheduler's
// registry; these exist so the binary does something useful out of the box.

pub const STOCK_LOOKUP: &str = "stock.lookup";
pub const BATCH_IMPORT: &str = "inventory.import";
pub const REPORT_EXPORT: &str = "report.export";

#[derive(Deserialize)]
struct LookupPayload {
    skus: Vec<String>,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ImportRow {
    sku: String,
    quantity: i64,
}

#[derive(Deserialize)]
struct ImportPayload {
    rows: Vec<ImportRow>,
}

#[derive(Deserialize)]
struct ExportPayload {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default)]
    warehouse: Option<String>,
}

fn default_format() -> String {
    "csv".to_string()
}

pub fn register_all(registry: &HandlerRegistry) {
    registry.register(STOCK_LOOKUP, stock_lookup);
    registry.register(BATCH_IMPORT, batch_import);
    registry.register_with_options(
        REPORT_EXPORT,
        report_export,
        HandlerOptions::new().timeout(Duration::from_secs(60)),
    );
}

/// Simulated external lookup, one SKU at a time. Stops early if the job is
/// cancelled between items.
async fn stock_lookup(job: Job, progress: ProgressReporter) -> Result<Value, JobError> {
    let p: LookupPayload = parse_payload(&job)?;
    if p.skus.is_empty() {
        return Err(JobError::bad_payload("skus must not be empty"));
    }

    let total = p.skus.len() as i64;
    progress.set_total_items(total).await?;

    let delay = Duration::from_millis(p.delay_ms.unwrap_or(200));
    let mut found = Vec::with_capacity(p.skus.len());
    for (i, sku) in p.skus.iter().enumerate() {
        if progress.is_cancelled().await? {
            return Err(JobError::new("CANCELLED", "lookup cancelled"));
        }
        tokio::time::sleep(delay).await;
        found.push(json!({ "sku": sku, "available": true }));

        let done = i as i64 + 1;
        progress.report(done as f64 * 100.0 / total as f64, done).await?;
    }

    Ok(json!({ "items": found }))
}

/// Validate and total a batch of stock rows. Any bad row fails the job.
async fn batch_import(job: Job, progress: ProgressReporter) -> Result<Value, JobError> {
    let p: ImportPayload = parse_payload(&job)?;
    let total = p.rows.len() as i64;
    progress.set_total_items(total).await?;

    let mut units = 0i64;
    for (i, row) in p.rows.iter().enumerate() {
        if row.sku.trim().is_empty() {
            return Err(JobError::msg(format!("row {}: sku is empty", i + 1)));
        }
        if row.quantity < 0 {
            return Err(JobError::msg(format!(
                "row {}: negative quantity for {}",
                i + 1,
                row.sku
            )));
        }
        units += row.quantity;

        let done = i as i64 + 1;
        if done % 50 == 0 || done == total {
            progress.report(done as f64 * 100.0 / total as f64, done).await?;
        }
    }

    Ok(json!({ "imported": total, "units": units }))
}

async fn report_export(job: Job, progress: ProgressReporter) -> Result<Value, JobError> {
    let p: ExportPayload = parse_payload(&job)?;
    if !matches!(p.format.as_str(), "csv" | "xlsx") {
        return Err(JobError::bad_payload(format!(
            "unsupported format: {}",
            p.format
        )));
    }

    progress.report(50.0, 0).await?;
    let scope = p.warehouse.unwrap_or_else(|| "all".to_string());
    let file = format!("stock-{}-{}.{}", scope, job.id, p.format);

    Ok(json!({ "file": file }))
}
