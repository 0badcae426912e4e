//! Scheduler - Scan Loop and Routing
//!
//! One explicit component owns the periodic pass: scan the drop folder,
//! register new content, resolve identifiers, route each record by kind and
//! confidence, and drive approved files through the render batch. All
//! collaborators are injected; nothing here is a process-wide singleton.

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::batch::{BatchOutcome, RenderBatch};
use crate::catalog::RenderSpec;
use crate::config::{IntakeConfig, PathConfig, PipelineConfig, SchedulerConfig};
use crate::engine::{trim_transparent, FormatRenderingEngine};
use crate::external::{
    notify_best_effort, remove_background_with_timeout, BackgroundRemover, NotificationSink,
};
use crate::identity::FileKind;
use crate::record::{detail, FileRecord, FileState};
use crate::resolver::{CatalogLookup, IdentifierResolver};
use crate::store::{FileRecordStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Input scan failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Render pool unavailable: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// What one scan pass did. Serialized verbatim by the CLI.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub scanned_files: usize,
    pub new_records: usize,
    pub resolved: usize,
    pub queued_for_review: usize,
    pub rendered: usize,
    pub transient_failures: usize,
    pub errors: usize,
}

pub struct Scheduler<L: CatalogLookup> {
    store: Arc<FileRecordStore>,
    resolver: IdentifierResolver<L>,
    catalog: RenderSpec,
    batch: RenderBatch,
    remover: Arc<dyn BackgroundRemover>,
    notifier: Arc<dyn NotificationSink>,
    tunables: SchedulerConfig,
    intake: IntakeConfig,
    paths: PathConfig,
}

impl<L: CatalogLookup> Scheduler<L> {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<FileRecordStore>,
        resolver: IdentifierResolver<L>,
        catalog: RenderSpec,
        remover: Arc<dyn BackgroundRemover>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, SchedulerError> {
        let pool = RenderBatch::build_pool(config.scheduler.render_pool_size)?;
        let engine = FormatRenderingEngine::new(config.paths.assets_dir.clone());
        let batch = RenderBatch::new(engine, config.paths.production_dir.clone(), pool);
        Ok(Self {
            store,
            resolver,
            catalog,
            batch,
            remover,
            notifier,
            tunables: config.scheduler.clone(),
            intake: config.intake.clone(),
            paths: config.paths.clone(),
        })
    }

    pub fn store(&self) -> &FileRecordStore {
        &self.store
    }

    /// One full scan pass. Per-record failures are logged and counted, never
    /// allowed to abort the pass.
    pub fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        let before = self.store.statistics()["total"];
        match self.scan_input() {
            Ok(scanned) => summary.scanned_files = scanned,
            Err(e) => {
                error!(error = %e, "input scan failed");
                summary.errors += 1;
            }
        }
        summary.new_records = self.store.statistics()["total"].saturating_sub(before);

        // Resolution pass. Records parked by a lookup outage stay here with
        // a backoff timestamp; retry_due skips them until the window opens.
        for record in self.store.retry_due(FileState::Discovered, Utc::now()) {
            self.resolve_record(&record, &mut summary);
        }

        // Routing pass for records parked mid-route (background-removal
        // outage keeps them in `identified`).
        for record in self.store.retry_due(FileState::Identified, Utc::now()) {
            if let Err(e) = self.route(&record.content_hash, &mut summary) {
                error!(hash = %record.content_hash, error = %e, "routing failed");
                summary.errors += 1;
            }
        }

        // Re-attempt pass for approved records without a finished batch:
        // interrupted renders rolled back at startup, and approvals whose
        // render attempt died on an I/O error.
        for record in self.store.retry_due(FileState::Approved, Utc::now()) {
            if let Err(e) = self.render_file(&record.content_hash, &mut summary) {
                error!(hash = %record.content_hash, error = %e, "render re-attempt failed");
                summary.errors += 1;
            }
        }

        summary
    }

    /// Run scan passes until `stop` fires or all senders drop.
    pub fn run_until(&self, stop: Receiver<()>) {
        let interval = Duration::from_secs(self.tunables.scan_interval_seconds.max(1));
        loop {
            let summary = self.tick();
            info!(
                scanned = summary.scanned_files,
                new = summary.new_records,
                rendered = summary.rendered,
                errors = summary.errors,
                "scan pass complete"
            );
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
    }

    /// Approve a reviewed file and immediately drive it through the batch.
    pub fn approve(&self, content_hash: &str) -> Result<FileRecord, SchedulerError> {
        self.store
            .transition(content_hash, FileState::Approved, "operator approval")?;
        let mut summary = TickSummary::default();
        self.render_file(content_hash, &mut summary)?;
        self.store
            .get(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()).into())
    }

    pub fn reject(&self, content_hash: &str, reason: &str) -> Result<FileRecord, SchedulerError> {
        Ok(self.store.reject(content_hash, reason)?)
    }

    /// Human-triggered retry of a decode-failed file: back into the review
    /// queue, backoff cleared.
    pub fn retry_failed(&self, content_hash: &str) -> Result<FileRecord, SchedulerError> {
        let record =
            self.store
                .transition(content_hash, FileState::AwaitingReview, "manual retry")?;
        self.store.clear_backoff(content_hash)?;
        Ok(record)
    }

    fn scan_input(&self) -> Result<usize, SchedulerError> {
        if !self.paths.input_dir.exists() {
            return Ok(0);
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.paths.input_dir)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if path.is_file() && !hidden {
                paths.push(path);
            }
        }

        let scanned = paths.len();
        let (tx, rx) = unbounded::<PathBuf>();
        for path in paths {
            let _ = tx.send(path);
        }
        drop(tx);

        // Hashing and probing are the expensive part of discovery; a small
        // worker set drains the queue.
        std::thread::scope(|s| {
            for _ in 0..self.tunables.worker_count.max(1) {
                let rx = rx.clone();
                s.spawn(move || {
                    while let Ok(path) = rx.recv() {
                        match fs::read(&path) {
                            Ok(bytes) => {
                                self.store.discover(&path, &bytes);
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "unreadable input file")
                            }
                        }
                    }
                });
            }
        });

        Ok(scanned)
    }

    fn resolve_record(&self, record: &FileRecord, summary: &mut TickSummary) {
        let hash = &record.content_hash;
        match self.resolver.resolve(&record.filename) {
            Ok(mapping) => {
                let attach = self
                    .store
                    .attach_mapping(hash, mapping)
                    .and_then(|_| self.store.clear_backoff(hash))
                    .and_then(|_| {
                        self.store
                            .transition(hash, FileState::Identified, "identifier resolution")
                    });
                match attach {
                    Ok(_) => {
                        summary.resolved += 1;
                        if let Err(e) = self.route(hash, summary) {
                            error!(hash = %hash, error = %e, "routing failed");
                            summary.errors += 1;
                        }
                    }
                    Err(e) => {
                        error!(hash = %hash, error = %e, "failed to record mapping");
                        summary.errors += 1;
                    }
                }
            }
            // Lookup outage: the record keeps its state and waits out the
            // backoff window.
            Err(e) => {
                warn!(hash = %hash, error = %e, "identifier lookup unavailable");
                if let Err(e) = self.store.mark_transient_failure(
                    hash,
                    &e.to_string(),
                    self.tunables.retry_backoff_base_seconds,
                    self.tunables.retry_backoff_cap_seconds,
                ) {
                    error!(hash = %hash, error = %e, "failed to record backoff");
                    summary.errors += 1;
                }
                summary.transient_failures += 1;
            }
        }
    }

    /// Route an identified record. Flat rasters get their background removed
    /// and always await approval; layered design files arrive already
    /// isolated and render straight away when the mapping is confident.
    fn route(&self, content_hash: &str, summary: &mut TickSummary) -> Result<(), SchedulerError> {
        let record = self
            .store
            .get(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;
        let needs_review = record
            .identifier_mapping
            .as_ref()
            .map_or(true, |m| m.requires_manual_review);

        match record.kind {
            FileKind::FlatRaster => {
                let bytes = fs::read(&record.source_path)?;
                let removed = remove_background_with_timeout(
                    Arc::clone(&self.remover),
                    bytes,
                    self.tunables.background_removal_model.clone(),
                    Duration::from_secs(self.tunables.background_removal_timeout_seconds),
                );
                match removed {
                    Ok(processed) => {
                        let staged = self.staged_path(content_hash);
                        if let Some(parent) = staged.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&staged, processed)?;
                        self.store.clear_backoff(content_hash)?;
                        let record = self.store.transition(
                            content_hash,
                            FileState::AwaitingReview,
                            "background removed, pending approval",
                        )?;
                        summary.queued_for_review += 1;
                        notify_best_effort(
                            self.notifier.as_ref(),
                            "awaiting_review",
                            &detail(&[
                                ("hash", content_hash),
                                ("filename", &record.filename),
                            ]),
                        );
                    }
                    Err(e) => {
                        warn!(hash = %content_hash, error = %e, "background removal unavailable");
                        self.store.mark_transient_failure(
                            content_hash,
                            &e.to_string(),
                            self.tunables.retry_backoff_base_seconds,
                            self.tunables.retry_backoff_cap_seconds,
                        )?;
                        summary.transient_failures += 1;
                    }
                }
            }
            FileKind::LayeredDesign => {
                if needs_review {
                    let record = self.store.transition(
                        content_hash,
                        FileState::AwaitingReview,
                        "low-confidence mapping, pending approval",
                    )?;
                    summary.queued_for_review += 1;
                    notify_best_effort(
                        self.notifier.as_ref(),
                        "awaiting_review",
                        &detail(&[("hash", content_hash), ("filename", &record.filename)]),
                    );
                } else {
                    self.render_file(content_hash, summary)?;
                }
            }
        }
        Ok(())
    }

    /// Decode, trim once, fan out over the catalog and settle the terminal
    /// state. Decode failures land in `failed` for a human-triggered retry.
    fn render_file(
        &self,
        content_hash: &str,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulerError> {
        let record = self
            .store
            .get(content_hash)
            .ok_or_else(|| StoreError::UnknownRecord(content_hash.to_string()))?;

        let staged = self.staged_path(content_hash);
        let bytes = if staged.exists() {
            fs::read(&staged)?
        } else {
            fs::read(&record.source_path)?
        };

        let decoded = match image::load_from_memory(&bytes) {
            Ok(img) => img,
            Err(e) => {
                self.store.transition(
                    content_hash,
                    FileState::Failed,
                    &format!("decode failed: {e}"),
                )?;
                notify_best_effort(
                    self.notifier.as_ref(),
                    "file_failed",
                    &detail(&[("hash", content_hash), ("filename", &record.filename)]),
                );
                return Ok(());
            }
        };

        // Sources the intake probe could not read skip the resolution check
        // at discovery; this is the first real decode, so enforce it here.
        let longest = decoded.width().max(decoded.height());
        if longest < self.intake.min_resolution {
            self.store.transition(
                content_hash,
                FileState::Rejected,
                &format!(
                    "ResolutionTooLow: longest side {longest} below minimum {}",
                    self.intake.min_resolution
                ),
            )?;
            return Ok(());
        }

        self.store
            .transition(content_hash, FileState::Rendering, "render batch started")?;

        let base_name = record
            .effective_identifier()
            .unwrap_or_else(|| stem_of(&record.filename));
        let source = trim_transparent(&decoded);
        let report = self.batch.run(&base_name, &source, &self.catalog);

        match report.outcome {
            BatchOutcome::Completed => {
                self.store.transition(
                    content_hash,
                    FileState::Completed,
                    "all derivatives rendered",
                )?;
                self.store.clear_backoff(content_hash)?;
                summary.rendered += 1;
                notify_best_effort(
                    self.notifier.as_ref(),
                    "render_completed",
                    &detail(&[
                        ("hash", content_hash),
                        ("identifier", &base_name),
                        ("batch_id", &report.batch_id.to_string()),
                    ]),
                );
            }
            BatchOutcome::Degraded { failed_entries } => {
                let reason = format!("degraded: entries failed: {}", failed_entries.join(", "));
                self.store
                    .transition(content_hash, FileState::Completed, &reason)?;
                self.store.clear_backoff(content_hash)?;
                summary.rendered += 1;
                notify_best_effort(
                    self.notifier.as_ref(),
                    "render_degraded",
                    &detail(&[
                        ("hash", content_hash),
                        ("identifier", &base_name),
                        ("failed_entries", &failed_entries.join(",")),
                    ]),
                );
            }
            BatchOutcome::Failed => {
                self.store.transition(
                    content_hash,
                    FileState::Failed,
                    "no derivatives rendered",
                )?;
                notify_best_effort(
                    self.notifier.as_ref(),
                    "file_failed",
                    &detail(&[("hash", content_hash), ("identifier", &base_name)]),
                );
            }
        }
        Ok(())
    }

    fn staged_path(&self, content_hash: &str) -> PathBuf {
        self.paths
            .production_dir
            .join("_staged")
            .join(format!("{content_hash}.png"))
    }
}

fn stem_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColorMode, ContainerFormat, RenderSpecEntry, ResizeMode};
    use crate::config::{IntakeConfig, PathConfig};
    use crate::external::{
        BackgroundRemovalError, MockBackgroundRemover, NotifyError, NullNotifier,
    };
    use crate::resolver::{AliasResolution, LookupError, MemoryCatalogLookup};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;

    fn test_config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.intake = IntakeConfig {
            min_file_size_bytes: 8,
            max_file_size_bytes: 64 * 1024 * 1024,
            min_resolution: 10,
        };
        config.paths = PathConfig {
            input_dir: root.join("input"),
            production_dir: root.join("production"),
            assets_dir: root.join("assets"),
            state_file: root.join("metadata/records.json"),
        };
        config.scheduler.render_pool_size = 2;
        config
    }

    fn test_catalog() -> RenderSpec {
        RenderSpec::from_entries(vec![RenderSpecEntry {
            name: "web".to_string(),
            container_format: ContainerFormat::Png,
            dpi: 72,
            color_mode: ColorMode::Alpha,
            background_fill: None,
            resize_mode: ResizeMode::FitLongest { target: 32 },
            canvas_extent: None,
            border_inset: (0, 0),
            overlay_icon: None,
            overlay_watermark: None,
            enabled: true,
        }])
        .unwrap()
    }

    fn scheduler_with(
        root: &Path,
        lookup: MemoryCatalogLookup,
    ) -> Scheduler<MemoryCatalogLookup> {
        let config = test_config(root);
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        let resolver = IdentifierResolver::new(lookup, config.resolver.clone());
        Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(MockBackgroundRemover),
            Arc::new(NullNotifier),
        )
        .unwrap()
    }

    fn lookup() -> MemoryCatalogLookup {
        MemoryCatalogLookup::new(
            vec!["J1234567".to_string(), "J7654321".to_string()],
            HashMap::new(),
        )
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([255, 255, 255, 255]));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        fs::write(path, buf.into_inner()).unwrap();
    }

    fn write_tiff(path: &Path, w: u32, h: u32) {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([40, 40, 40, 255]));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Tiff)
            .unwrap();
        fs::write(path, buf.into_inner()).unwrap();
    }

    #[test]
    fn flat_raster_is_staged_and_queued_for_review() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), lookup());
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);

        let summary = scheduler.tick();
        assert_eq!(summary.scanned_files, 1);
        assert_eq!(summary.new_records, 1);
        assert_eq!(summary.queued_for_review, 1);

        let records = scheduler.store().by_state(FileState::AwaitingReview);
        assert_eq!(records.len(), 1);
        assert!(dir
            .path()
            .join("production/_staged")
            .join(format!("{}.png", records[0].content_hash))
            .exists());
    }

    #[test]
    fn approval_renders_from_staged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), lookup());
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);
        scheduler.tick();

        let hash = scheduler.store().by_state(FileState::AwaitingReview)[0]
            .content_hash
            .clone();
        let record = scheduler.approve(&hash).unwrap();
        assert_eq!(record.state, FileState::Completed);
        assert!(dir.path().join("production/web/J1234567.png").exists());
    }

    #[test]
    fn confident_layered_design_renders_without_review() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), lookup());
        write_tiff(&dir.path().join("input/J7654321.tif"), 64, 48);

        let summary = scheduler.tick();
        assert_eq!(summary.rendered, 1);
        assert_eq!(scheduler.store().by_state(FileState::Completed).len(), 1);
        assert!(dir.path().join("production/web/J7654321.png").exists());
    }

    #[test]
    fn unresolved_layered_design_waits_for_review() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), lookup());
        write_tiff(&dir.path().join("input/mystery_part.tif"), 64, 48);

        let summary = scheduler.tick();
        assert_eq!(summary.queued_for_review, 1);
        let record = &scheduler.store().by_state(FileState::AwaitingReview)[0];
        let mapping = record.identifier_mapping.as_ref().unwrap();
        assert!(mapping.requires_manual_review);
        assert!(mapping.mapped_identifier.is_none());
    }

    struct OutageLookup;

    impl CatalogLookup for OutageLookup {
        fn resolve_active(&self, _: &str) -> Result<Option<String>, LookupError> {
            Err(LookupError::Unavailable("connection refused".to_string()))
        }
        fn resolve_alias(&self, _: &str) -> Result<Option<AliasResolution>, LookupError> {
            Err(LookupError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn lookup_outage_keeps_state_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        let resolver = IdentifierResolver::new(OutageLookup, config.resolver.clone());
        let scheduler = Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(MockBackgroundRemover),
            Arc::new(NullNotifier),
        )
        .unwrap();
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);

        let summary = scheduler.tick();
        assert_eq!(summary.transient_failures, 1);

        let record = &scheduler.store().by_state(FileState::Discovered)[0];
        assert_eq!(record.retry_count, 1);
        assert!(record.next_retry_at.is_some());

        // The backoff window keeps the second pass from re-resolving.
        scheduler.tick();
        assert_eq!(
            scheduler.store().by_state(FileState::Discovered)[0].retry_count,
            1
        );
    }

    struct BrokenRemover;

    impl BackgroundRemover for BrokenRemover {
        fn remove_background(
            &self,
            _: &[u8],
            _: &str,
        ) -> Result<Vec<u8>, BackgroundRemovalError> {
            Err(BackgroundRemovalError::ModelUnavailable(
                "model server down".to_string(),
            ))
        }
    }

    #[test]
    fn removal_outage_parks_record_in_identified() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        let resolver = IdentifierResolver::new(lookup(), config.resolver.clone());
        let scheduler = Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(BrokenRemover),
            Arc::new(NullNotifier),
        )
        .unwrap();
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);

        let summary = scheduler.tick();
        assert_eq!(summary.transient_failures, 1);
        let record = &scheduler.store().by_state(FileState::Identified)[0];
        assert_eq!(record.retry_count, 1);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(
            &self,
            event_name: &str,
            _: &BTreeMap<String, String>,
        ) -> Result<(), NotifyError> {
            self.events.lock().push(event_name.to_string());
            Ok(())
        }
    }

    #[test]
    fn review_and_completion_events_are_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        let resolver = IdentifierResolver::new(lookup(), config.resolver.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(MockBackgroundRemover),
            Arc::clone(&notifier) as Arc<dyn NotificationSink>,
        )
        .unwrap();
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);

        scheduler.tick();
        let hash = scheduler.store().by_state(FileState::AwaitingReview)[0]
            .content_hash
            .clone();
        scheduler.approve(&hash).unwrap();

        let events = notifier.events.lock().clone();
        assert!(events.contains(&"awaiting_review".to_string()));
        assert!(events.contains(&"render_completed".to_string()));
    }

    #[test]
    fn recovered_approved_record_is_rerendered_by_tick() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let hash = {
            let scheduler = scheduler_with(dir.path(), lookup());
            write_png(&dir.path().join("input/J1234567.png"), 64, 64);
            scheduler.tick();

            let hash = scheduler.store().by_state(FileState::AwaitingReview)[0]
                .content_hash
                .clone();
            // Crash mid-batch: approved, rendering started, process dies
            // before the batch settles.
            scheduler
                .store()
                .transition(&hash, FileState::Approved, "operator approval")
                .unwrap();
            scheduler
                .store()
                .transition(&hash, FileState::Rendering, "render batch started")
                .unwrap();
            hash
        };

        // Restart: recovery rolls the record back to approved, and the next
        // scan pass drives it through the batch without a second approval.
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        assert_eq!(store.get(&hash).unwrap().state, FileState::Approved);

        let resolver = IdentifierResolver::new(lookup(), config.resolver.clone());
        let scheduler = Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(MockBackgroundRemover),
            Arc::new(NullNotifier),
        )
        .unwrap();

        let summary = scheduler.tick();
        assert_eq!(summary.rendered, 1);
        assert_eq!(
            scheduler.store().get(&hash).unwrap().state,
            FileState::Completed
        );
        assert!(dir.path().join("production/web/J1234567.png").exists());
    }

    struct TinyOutputRemover;

    impl BackgroundRemover for TinyOutputRemover {
        fn remove_background(
            &self,
            _: &[u8],
            _: &str,
        ) -> Result<Vec<u8>, BackgroundRemovalError> {
            let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([5, 5, 5, 255]));
            let mut buf = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgba8(img)
                .write_to(&mut buf, image::ImageFormat::Png)
                .map_err(|e| BackgroundRemovalError::Failed(e.to_string()))?;
            Ok(buf.into_inner())
        }
    }

    #[test]
    fn late_decode_enforces_minimum_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(
            FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
                .unwrap(),
        );
        let resolver = IdentifierResolver::new(lookup(), config.resolver.clone());
        let scheduler = Scheduler::new(
            &config,
            store,
            resolver,
            test_catalog(),
            Arc::new(TinyOutputRemover),
            Arc::new(NullNotifier),
        )
        .unwrap();

        // Bytes the intake probe cannot read: no dimensions recorded, so
        // the resolution gate is deferred to the first real decode.
        let input = dir.path().join("input/J1234567.bin");
        fs::create_dir_all(input.parent().unwrap()).unwrap();
        fs::write(&input, vec![0u8; 64]).unwrap();

        scheduler.tick();
        let pending = scheduler.store().by_state(FileState::AwaitingReview);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].pixel_dimensions.is_none());

        // The staged replacement decodes at 4x4, below the minimum of 10.
        let record = scheduler.approve(&pending[0].content_hash).unwrap();
        assert_eq!(record.state, FileState::Rejected);
        assert!(record.history.iter().any(|h| {
            h.detail
                .get("reason")
                .is_some_and(|r| r.contains("ResolutionTooLow"))
        }));
        assert!(!dir.path().join("production/web/J1234567.png").exists());
    }

    #[test]
    fn rejection_from_review_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with(dir.path(), lookup());
        write_png(&dir.path().join("input/J1234567.png"), 64, 64);
        scheduler.tick();

        let hash = scheduler.store().by_state(FileState::AwaitingReview)[0]
            .content_hash
            .clone();
        let record = scheduler.reject(&hash, "wrong product").unwrap();
        assert_eq!(record.state, FileState::Rejected);

        // Re-scanning the same bytes does not resurrect the file.
        let summary = scheduler.tick();
        assert_eq!(summary.new_records, 0);
        assert_eq!(scheduler.store().by_state(FileState::Rejected).len(), 1);
    }
}
