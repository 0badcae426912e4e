//! File Records - Lifecycle Model
//!
//! A record is created on first sighting of a new content hash and never
//! deleted; it only moves forward until it lands in a terminal state. The
//! history log is append-only and doubles as the crash-recovery source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::identity::{ContentIdentity, FileKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Identified,
    AwaitingReview,
    Approved,
    Rendering,
    Completed,
    Rejected,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Completed | FileState::Rejected)
    }

    /// Legal forward edges of the lifecycle. `Rejected` and `Failed` are
    /// reachable from any non-terminal state; `Failed` re-enters review via
    /// retry. Everything else is an invariant violation.
    pub fn can_transition_to(self, to: FileState) -> bool {
        if self == to {
            return false;
        }
        match (self, to) {
            (from, FileState::Rejected) if !from.is_terminal() && from != FileState::Rendering => {
                true
            }
            (from, FileState::Failed) if !from.is_terminal() => true,
            (FileState::Discovered, FileState::Identified) => true,
            (FileState::Identified, FileState::AwaitingReview)
            | (FileState::Identified, FileState::Rendering) => true,
            (FileState::AwaitingReview, FileState::Approved) => true,
            (FileState::Approved, FileState::Rendering) => true,
            (FileState::Rendering, FileState::Completed) => true,
            // Crash recovery rolls an interrupted batch back to its
            // pre-render state.
            (FileState::Rendering, FileState::Approved)
            | (FileState::Rendering, FileState::AwaitingReview) => true,
            (FileState::Failed, FileState::AwaitingReview) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileState::Discovered => "discovered",
            FileState::Identified => "identified",
            FileState::AwaitingReview => "awaiting_review",
            FileState::Approved => "approved",
            FileState::Rendering => "rendering",
            FileState::Completed => "completed",
            FileState::Rejected => "rejected",
            FileState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a filename resolved to a catalog identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    DirectMatch,
    NumberedVariant,
    InterchangeAlias,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub mapped_identifier: Option<String>,
    pub method: MappingMethod,
    pub confidence_score: f64,
    pub requires_manual_review: bool,
    /// The legacy identifier when the match came through the interchange
    /// alias table.
    pub alias_source: Option<String>,
    /// Candidate tokens extracted from the filename, most literal first.
    pub candidates: Vec<String>,
}

/// A human edit of system-derived metadata. Never silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualOverride {
    pub value: String,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

/// One tracked source file, keyed by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_hash: String,
    pub state: FileState,
    pub filename: String,
    pub source_path: PathBuf,
    pub size_bytes: u64,
    pub pixel_dimensions: Option<(u32, u32)>,
    pub kind: FileKind,
    pub identifier_mapping: Option<IdentifierMapping>,
    #[serde(default)]
    pub manual_overrides: BTreeMap<String, ManualOverride>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(identity: &ContentIdentity, filename: String, source_path: PathBuf) -> Self {
        Self {
            content_hash: identity.content_hash.clone(),
            state: FileState::Discovered,
            filename,
            source_path,
            size_bytes: identity.size_bytes,
            pixel_dimensions: identity.pixel_dimensions,
            kind: identity.kind,
            identifier_mapping: None,
            manual_overrides: BTreeMap::new(),
            history: Vec::new(),
            retry_count: 0,
            next_retry_at: None,
            created_at: Utc::now(),
        }
    }

    /// Append one step to the audit trail. History is never mutated in place.
    pub fn append_history(&mut self, step: &str, detail: BTreeMap<String, String>) {
        self.history.push(HistoryEntry {
            step: step.to_string(),
            timestamp: Utc::now(),
            detail,
        });
    }

    /// Effective identifier: a manual override of `mapped_identifier` takes
    /// permanent precedence over the computed mapping.
    pub fn effective_identifier(&self) -> Option<String> {
        if let Some(ov) = self.manual_overrides.get("mapped_identifier") {
            return Some(ov.value.clone());
        }
        self.identifier_mapping
            .as_ref()
            .and_then(|m| m.mapped_identifier.clone())
    }

    /// State the record held before entering `Rendering`, derived from the
    /// history log alone. Used for crash recovery.
    pub fn pre_render_state(&self) -> FileState {
        for entry in self.history.iter().rev() {
            if entry.step == "state_change" {
                match entry.detail.get("to").map(String::as_str) {
                    Some("rendering") => {
                        if let Some(from) = entry.detail.get("from") {
                            if from == "approved" {
                                return FileState::Approved;
                            }
                        }
                        return FileState::AwaitingReview;
                    }
                    _ => continue,
                }
            }
        }
        FileState::AwaitingReview
    }
}

pub fn detail(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for to in [
            FileState::Discovered,
            FileState::Identified,
            FileState::AwaitingReview,
            FileState::Approved,
            FileState::Rendering,
            FileState::Completed,
            FileState::Rejected,
            FileState::Failed,
        ] {
            assert!(!FileState::Completed.can_transition_to(to));
            assert!(!FileState::Rejected.can_transition_to(to));
        }
    }

    #[test]
    fn happy_path_is_legal() {
        assert!(FileState::Discovered.can_transition_to(FileState::Identified));
        assert!(FileState::Identified.can_transition_to(FileState::AwaitingReview));
        assert!(FileState::AwaitingReview.can_transition_to(FileState::Approved));
        assert!(FileState::Approved.can_transition_to(FileState::Rendering));
        assert!(FileState::Rendering.can_transition_to(FileState::Completed));
    }

    #[test]
    fn rendering_cannot_be_rejected_directly() {
        assert!(!FileState::Rendering.can_transition_to(FileState::Rejected));
        assert!(FileState::Rendering.can_transition_to(FileState::Failed));
    }

    #[test]
    fn failed_reenters_review() {
        assert!(FileState::Failed.can_transition_to(FileState::AwaitingReview));
        assert!(!FileState::Failed.can_transition_to(FileState::Completed));
    }

    #[test]
    fn backwards_edges_are_illegal() {
        assert!(!FileState::Completed.can_transition_to(FileState::Discovered));
        assert!(!FileState::Approved.can_transition_to(FileState::Discovered));
        assert!(!FileState::Identified.can_transition_to(FileState::Approved));
    }

    #[test]
    fn pre_render_state_follows_history() {
        let identity = crate::identity::ContentIdentity {
            content_hash: "abc".into(),
            size_bytes: 10,
            kind: FileKind::FlatRaster,
            pixel_dimensions: None,
        };
        let mut record = FileRecord::new(&identity, "x.jpg".into(), PathBuf::from("x.jpg"));
        record.append_history(
            "state_change",
            detail(&[("from", "approved"), ("to", "rendering")]),
        );
        assert_eq!(record.pre_render_state(), FileState::Approved);

        record.append_history(
            "state_change",
            detail(&[("from", "identified"), ("to", "rendering")]),
        );
        assert_eq!(record.pre_render_state(), FileState::AwaitingReview);
    }

    #[test]
    fn override_wins_over_mapping() {
        let identity = crate::identity::ContentIdentity {
            content_hash: "abc".into(),
            size_bytes: 10,
            kind: FileKind::FlatRaster,
            pixel_dimensions: None,
        };
        let mut record = FileRecord::new(&identity, "x.jpg".into(), PathBuf::from("x.jpg"));
        record.identifier_mapping = Some(IdentifierMapping {
            mapped_identifier: Some("J1111111".into()),
            method: MappingMethod::DirectMatch,
            confidence_score: 1.0,
            requires_manual_review: false,
            alias_source: None,
            candidates: vec!["J1111111".into()],
        });
        record.manual_overrides.insert(
            "mapped_identifier".into(),
            ManualOverride {
                value: "J2222222".into(),
                reason: "mislabeled master".into(),
                applied_at: Utc::now(),
            },
        );
        assert_eq!(record.effective_identifier().as_deref(), Some("J2222222"));
    }
}
