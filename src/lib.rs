//! ImageWorks Core - Product Image Derivative Pipeline
//!
//! # The Ground Rules (Non-Negotiable)
//! 1. Content Hash Is Identity
//! 2. The Spec Catalog Is a Contract
//! 3. Transitions Are Loud, Never Clamped
//! 4. History Is Append-Only
//! 5. Overrides Outlive Recomputation
//! 6. Collaborators Stay Behind Traits

pub mod batch;
pub mod catalog;
pub mod config;
pub mod dpi;
pub mod engine;
pub mod external;
pub mod identity;
pub mod record;
pub mod resolver;
pub mod scheduler;
pub mod store;

pub use batch::{BatchOutcome, BatchReport, RenderBatch, RenderResult};
pub use catalog::{CatalogError, ColorMode, ContainerFormat, RenderSpec, RenderSpecEntry};
pub use config::PipelineConfig;
pub use engine::{FormatRenderingEngine, RenderError, RenderedArtifact};
pub use identity::{sha256_hex, ContentIdentity, FileKind};
pub use record::{FileRecord, FileState, IdentifierMapping, MappingMethod};
pub use resolver::{CatalogLookup, IdentifierResolver, MemoryCatalogLookup};
pub use scheduler::{Scheduler, SchedulerError, TickSummary};
pub use store::{FileRecordStore, StoreError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
