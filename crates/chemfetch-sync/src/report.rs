//! Files written at the end of a run.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use chemfetch_core::{flatten_record, FlatRow, FLAT_COLUMNS};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{EntityOutcome, RunSummary};

pub const RESULTS_JSON: &str = "results.json";
pub const RESULTS_CSV: &str = "results.csv";
pub const RUN_BRIEF: &str = "run_brief.md";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const FLAT_PARQUET: &str = "flat_rows.parquet";
pub const MANIFEST_JSON: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn flat_rows(outcomes: &[EntityOutcome]) -> Vec<FlatRow> {
    outcomes.iter().map(|o| flatten_record(&o.record)).collect()
}

pub async fn write_run_outputs(
    output_dir: &Path,
    outcomes: &[EntityOutcome],
    summary: &RunSummary,
) -> Result<()> {
    let results = serde_json::to_vec_pretty(outcomes).context("serializing results")?;
    let results_path = output_dir.join(RESULTS_JSON);
    fs::write(&results_path, results)
        .await
        .with_context(|| format!("writing {}", results_path.display()))?;

    let rows = flat_rows(outcomes);
    write_flat_csv(&output_dir.join(RESULTS_CSV), &rows)?;
    export_parquet_snapshot(output_dir, summary, &rows).await?;

    let brief_path = output_dir.join(RUN_BRIEF);
    fs::write(&brief_path, run_brief_markdown(summary))
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;
    Ok(())
}

pub fn load_results(path: impl AsRef<Path>) -> Result<Vec<EntityOutcome>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Header is always [`FLAT_COLUMNS`], even with no rows.
pub fn write_flat_csv(path: &Path, rows: &[FlatRow]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(FLAT_COLUMNS)
        .with_context(|| format!("writing header {}", path.display()))?;
    for row in rows {
        writer
            .write_record(row.values())
            .with_context(|| format!("writing row {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let errors = if summary.errors_by_kind.is_empty() {
        "- none".to_string()
    } else {
        summary
            .errors_by_kind
            .iter()
            .map(|(kind, count)| format!("- {kind}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Chemfetch Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n\
         - Names: {}\n- Resolved: {}\n- Not found: {}\n- With errors: {}\n\
         - Assets written: {}\n\n## Errors By Kind\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.total,
        summary.resolved,
        summary.not_found,
        summary.with_errors,
        summary.assets_written,
        errors,
    )
}

async fn export_parquet_snapshot(
    output_dir: &Path,
    summary: &RunSummary,
    rows: &[FlatRow],
) -> Result<PathBuf> {
    let snapshot_dir = output_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join(FLAT_PARQUET);
    write_parquet(&parquet_path, flat_rows_batch(rows)?)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files: vec![manifest_entry("flat_rows", output_dir, &parquet_path)?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_JSON);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn column_type(name: &str) -> DataType {
    match name {
        "activities_count" | "mechanisms_count" => DataType::UInt64,
        "has_drug_record" => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

fn flat_rows_batch(rows: &[FlatRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        FLAT_COLUMNS
            .iter()
            .map(|name| {
                let data_type = column_type(name);
                let nullable = data_type == DataType::Utf8 && *name != "drug_name";
                Field::new(*name, data_type, nullable)
            })
            .collect::<Vec<_>>(),
    ));

    let cells: Vec<[String; 26]> = rows.iter().map(FlatRow::values).collect();
    let columns = FLAT_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, name)| -> ArrayRef {
            match column_type(name) {
                DataType::UInt64 => Arc::new(UInt64Array::from(
                    rows.iter()
                        .map(|r| match *name {
                            "activities_count" => r.activities_count,
                            _ => r.mechanisms_count,
                        })
                        .collect::<Vec<_>>(),
                )),
                DataType::Boolean => Arc::new(BooleanArray::from(
                    rows.iter().map(|r| r.has_drug_record).collect::<Vec<_>>(),
                )),
                _ => Arc::new(StringArray::from(
                    cells
                        .iter()
                        .map(|c| Some(c[i].as_str()).filter(|s| i == 0 || !s.is_empty()))
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();

    RecordBatch::try_new(schema, columns).context("building flat_rows record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
