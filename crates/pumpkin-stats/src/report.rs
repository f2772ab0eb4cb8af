//! Per-run report directories: summary JSON, rank snapshot parquet, sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use pumpkin_core::PumpkinRanks;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::jobs::JobSummary;
use crate::rank::RankTable;

pub const SUMMARY_FILE: &str = "summary.json";
pub const RANKINGS_FILE: &str = "rankings.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `<reports_dir>/<job>/<run_id>/` and return that directory.
pub async fn write_run_report(
    reports_dir: &Path,
    summary: &JobSummary,
    ranks: Option<&RankTable>,
) -> Result<PathBuf> {
    let run_dir = reports_dir
        .join(summary.job.name())
        .join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_path = run_dir.join(SUMMARY_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing job summary")?;
    fs::write(&summary_path, bytes)
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let mut files = vec![manifest_entry("summary", &run_dir, &summary_path)?];
    if let Some(ranks) = ranks {
        let rankings_path = run_dir.join(RANKINGS_FILE);
        write_rankings_parquet(&rankings_path, ranks)?;
        files.push(manifest_entry("rankings", &run_dir, &rankings_path)?);
    }

    let manifest = ReportManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = run_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

fn write_rankings_parquet(path: &Path, ranks: &RankTable) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("pumpkin_id", DataType::Utf8, false),
        ArrowField::new("lifetime_global_rank", DataType::UInt32, true),
        ArrowField::new("year_global_rank", DataType::UInt32, true),
        ArrowField::new("lifetime_state_rank", DataType::UInt32, true),
        ArrowField::new("yearly_state_rank", DataType::UInt32, true),
        ArrowField::new("lifetime_country_rank", DataType::UInt32, true),
        ArrowField::new("yearly_country_rank", DataType::UInt32, true),
    ]));

    let ids = StringArray::from(ranks.keys().map(|id| Some(id.as_str())).collect::<Vec<_>>());
    let column = |pick: fn(&PumpkinRanks) -> Option<u32>| -> ArrayRef {
        Arc::new(UInt32Array::from(ranks.values().map(pick).collect::<Vec<_>>()))
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            column(|r| r.lifetime_global_rank),
            column(|r| r.year_global_rank),
            column(|r| r.lifetime_state_rank),
            column(|r| r.yearly_state_rank),
            column(|r| r.lifetime_country_rank),
            column(|r| r.yearly_country_rank),
        ],
    )
    .context("building rankings record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = parquet::arrow::ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Most recent run summaries under `reports_dir`, newest first.
pub fn recent_summaries(reports_dir: &Path, limit: usize) -> Result<Vec<JobSummary>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut summaries = Vec::new();
    let jobs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for job_dir in jobs.filter_map(|entry| entry.ok()) {
        if !job_dir.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let runs = std::fs::read_dir(job_dir.path())
            .with_context(|| format!("reading {}", job_dir.path().display()))?;
        for run in runs.filter_map(|entry| entry.ok()) {
            let path = run.path().join(SUMMARY_FILE);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let summary: JobSummary = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    summaries.truncate(limit.max(1));
    Ok(summaries)
}

/// Markdown digest of the latest runs.
pub fn report_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut lines = vec!["# Pumpkin Stats Runs".to_string(), String::new()];
    for summary in recent_summaries(reports_dir, runs)? {
        lines.push(format!("## {} `{}`", summary.job, summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at.to_rfc3339()));
        lines.push(format!("- loaded: {} ({} malformed)", summary.loaded, summary.malformed));
        lines.push(format!(
            "- written: {} in {} chunks, {} skipped",
            summary.write.committed, summary.write.chunks, summary.write.skipped
        ));
        if summary.disqualified > 0 {
            lines.push(format!("- disqualified: {}", summary.disqualified));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
