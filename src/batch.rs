//! Render Batch - Fan-Out Over the Spec Catalog
//!
//! One batch renders every enabled spec entry for one file. Entries are
//! independent; no entry output feeds another, so they run in parallel on
//! the shared render pool. A single bad entry never takes its siblings
//! down with it.

use image::DynamicImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalog::{RenderSpec, RenderSpecEntry};
use crate::engine::FormatRenderingEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedOutput {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// Per-(file, spec entry) result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub spec_name: String,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EntryOutcome {
    Succeeded { output: RenderedOutput },
    Failed { reason: String },
}

impl RenderResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Succeeded { .. })
    }
}

/// Batch-level classification surfaced to the review UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every enabled entry produced its artifact.
    Completed,
    /// Some entries failed; the file still moves forward, flagged.
    Degraded { failed_entries: Vec<String> },
    /// Nothing rendered.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub outcome: BatchOutcome,
    pub results: Vec<RenderResult>,
}

pub struct RenderBatch {
    engine: FormatRenderingEngine,
    production_dir: PathBuf,
    pool: Arc<rayon::ThreadPool>,
}

impl RenderBatch {
    pub fn new(
        engine: FormatRenderingEngine,
        production_dir: PathBuf,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        Self {
            engine,
            production_dir,
            pool,
        }
    }

    /// Build the shared render pool. Rendering is CPU-bound; the pool is
    /// shared across files, never per-file.
    pub fn build_pool(
        size: usize,
    ) -> Result<Arc<rayon::ThreadPool>, rayon::ThreadPoolBuildError> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("render-{i}"));
        if size > 0 {
            builder = builder.num_threads(size);
        }
        Ok(Arc::new(builder.build()?))
    }

    /// Render every enabled entry for one decoded source image. Artifacts
    /// land under `<production_dir>/<entry_name>/<base_name>.<ext>`.
    pub fn run(&self, base_name: &str, source: &DynamicImage, spec: &RenderSpec) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let entries: Vec<&RenderSpecEntry> = spec.enabled_entries().collect();

        let results: Vec<RenderResult> = self.pool.install(|| {
            entries
                .par_iter()
                .map(|entry| self.render_entry(base_name, source, entry))
                .collect()
        });

        let failed_entries: Vec<String> = results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.spec_name.clone())
            .collect();

        let outcome = if failed_entries.is_empty() {
            BatchOutcome::Completed
        } else if failed_entries.len() == results.len() {
            BatchOutcome::Failed
        } else {
            BatchOutcome::Degraded { failed_entries }
        };

        info!(
            %batch_id,
            base_name,
            total = results.len(),
            failed = results.iter().filter(|r| !r.succeeded()).count(),
            "render batch finished"
        );

        BatchReport {
            batch_id,
            outcome,
            results,
        }
    }

    fn render_entry(
        &self,
        base_name: &str,
        source: &DynamicImage,
        entry: &RenderSpecEntry,
    ) -> RenderResult {
        match self.engine.render(source, entry) {
            Ok(artifact) => {
                let dir = self.production_dir.join(&entry.name);
                let path = dir.join(format!(
                    "{}.{}",
                    base_name,
                    entry.container_format.extension()
                ));
                let written = fs::create_dir_all(&dir).and_then(|_| fs::write(&path, &artifact.bytes));
                match written {
                    Ok(()) => RenderResult {
                        spec_name: entry.name.clone(),
                        outcome: EntryOutcome::Succeeded {
                            output: RenderedOutput {
                                path,
                                width: artifact.width,
                                height: artifact.height,
                                size_bytes: artifact.bytes.len() as u64,
                            },
                        },
                    },
                    Err(e) => {
                        error!(entry = %entry.name, error = %e, "artifact write failed");
                        RenderResult {
                            spec_name: entry.name.clone(),
                            outcome: EntryOutcome::Failed {
                                reason: format!("write failed: {e}"),
                            },
                        }
                    }
                }
            }
            Err(e) => {
                error!(entry = %entry.name, error = %e, "render failed");
                RenderResult {
                    spec_name: entry.name.clone(),
                    outcome: EntryOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }
}
