//! Identifier Resolver - Filename to Catalog Identifier
//!
//! Tiered pattern matching in strict priority order; the most literal
//! reading of the filename always wins. The catalog lookup itself is an
//! external collaborator behind a trait.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::config::ResolverConfig;
use crate::record::{IdentifierMapping, MappingMethod};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Catalog lookup unavailable: {0}")]
    Unavailable(String),
}

/// Alias-table hit: a legacy identifier resolving to a current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasResolution {
    pub current_identifier: String,
    pub confidence_hint: Option<f64>,
}

/// Read-only product-master lookup. Queried with stripped filename tokens;
/// implementations may be remote and fail transiently.
pub trait CatalogLookup: Send + Sync {
    /// Returns the identifier when `token` is a currently active catalog
    /// identifier.
    fn resolve_active(&self, token: &str) -> Result<Option<String>, LookupError>;

    /// Returns the current identifier when `token` matches a legacy alias.
    fn resolve_alias(&self, token: &str) -> Result<Option<AliasResolution>, LookupError>;
}

/// In-memory lookup table. Backs tests and the offline CLI mode; production
/// deployments wire a database-backed implementation in its place.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryCatalogLookup {
    #[serde(default)]
    pub active: Vec<String>,
    /// alias -> current identifier
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl MemoryCatalogLookup {
    pub fn new(active: Vec<String>, aliases: HashMap<String, String>) -> Self {
        Self { active, aliases }
    }
}

impl CatalogLookup for MemoryCatalogLookup {
    fn resolve_active(&self, token: &str) -> Result<Option<String>, LookupError> {
        Ok(self
            .active
            .iter()
            .find(|id| id.as_str() == token)
            .cloned())
    }

    fn resolve_alias(&self, token: &str) -> Result<Option<AliasResolution>, LookupError> {
        Ok(self.aliases.get(token).map(|current| AliasResolution {
            current_identifier: current.clone(),
            confidence_hint: None,
        }))
    }
}

/// One extracted token plus how many suffix layers were stripped to get it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    token: String,
    stripped_layers: u32,
}

pub struct IdentifierResolver<L: CatalogLookup> {
    lookup: L,
    config: ResolverConfig,
}

impl<L: CatalogLookup> IdentifierResolver<L> {
    pub fn new(lookup: L, config: ResolverConfig) -> Self {
        Self { lookup, config }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Resolve a bare filename (no path) to an identifier mapping.
    /// Transient lookup failures propagate so the caller can back off and
    /// retry without recording a bogus `unresolved`.
    pub fn resolve(&self, filename: &str) -> Result<IdentifierMapping, LookupError> {
        let candidates = extract_candidates(filename);
        let candidate_tokens: Vec<String> =
            candidates.iter().map(|c| c.token.clone()).collect();

        // Tier 1: the unstripped stem is an active identifier.
        if let Some(first) = candidates.first() {
            if first.stripped_layers == 0 {
                if let Some(id) = self.lookup.resolve_active(&first.token)? {
                    return Ok(self.mapping(
                        Some(id),
                        MappingMethod::DirectMatch,
                        1.0,
                        None,
                        candidate_tokens,
                    ));
                }
            }
        }

        // Tier 2: active identifier after discarding variant suffix layers.
        // Fewer stripped layers score higher; candidates are already ordered
        // most literal first.
        for candidate in candidates.iter().filter(|c| c.stripped_layers > 0) {
            if let Some(id) = self.lookup.resolve_active(&candidate.token)? {
                let confidence = (self.config.variant_base_confidence
                    - self.config.variant_step * (candidate.stripped_layers - 1) as f64)
                    .max(self.config.variant_floor);
                return Ok(self.mapping(
                    Some(id),
                    MappingMethod::NumberedVariant,
                    confidence,
                    None,
                    candidate_tokens,
                ));
            }
        }

        // Tier 3: legacy identifier in the interchange alias table.
        for candidate in &candidates {
            if let Some(alias) = self.lookup.resolve_alias(&candidate.token)? {
                let confidence = alias
                    .confidence_hint
                    .unwrap_or(self.config.alias_confidence)
                    .clamp(0.0, self.config.alias_confidence);
                return Ok(self.mapping(
                    Some(alias.current_identifier),
                    MappingMethod::InterchangeAlias,
                    confidence,
                    Some(candidate.token.clone()),
                    candidate_tokens,
                ));
            }
        }

        // Tier 4: no match anywhere.
        debug!(filename, "no identifier match at any tier");
        Ok(self.mapping(
            None,
            MappingMethod::Unresolved,
            0.0,
            None,
            candidate_tokens,
        ))
    }

    fn mapping(
        &self,
        mapped_identifier: Option<String>,
        method: MappingMethod,
        confidence_score: f64,
        alias_source: Option<String>,
        candidates: Vec<String>,
    ) -> IdentifierMapping {
        let requires_manual_review = method == MappingMethod::Unresolved
            || confidence_score < self.config.review_threshold;
        IdentifierMapping {
            mapped_identifier,
            method,
            confidence_score,
            requires_manual_review,
            alias_source,
            candidates,
        }
    }
}

/// Suffixes carrying shot descriptions rather than identity.
const DESCRIPTIVE_SUFFIXES: &[&str] = &[
    "_DETAIL", "_MAIN", "_FRONT", "_BACK", "_TOP", "_BOTTOM",
];

/// Extract candidate tokens, most literal first. Layer 0 is the bare stem;
/// each further layer strips exactly one trailing variant marker.
fn extract_candidates(filename: &str) -> Vec<Candidate> {
    let stem = match filename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && !stem.is_empty() => stem,
        _ => filename,
    };
    let stem = stem.trim().to_ascii_uppercase();
    if stem.is_empty() {
        return Vec::new();
    }

    let mut candidates = vec![Candidate {
        token: stem.clone(),
        stripped_layers: 0,
    }];
    let mut current = stem;
    let mut layers = 0u32;

    while let Some(stripped) = strip_one_layer(&current) {
        layers += 1;
        if candidates.iter().all(|c| c.token != stripped) {
            candidates.push(Candidate {
                token: stripped.clone(),
                stripped_layers: layers,
            });
        }
        current = stripped;
    }

    candidates
}

/// Remove exactly one trailing suffix layer, or None when nothing more can
/// be stripped without destroying the token.
fn strip_one_layer(token: &str) -> Option<String> {
    const MIN_TOKEN: usize = 4;

    // Parenthetical variant: "12345 (2)" / "12345(2)".
    if let Some(open) = token.rfind('(') {
        let inner = &token[open + 1..];
        if let Some(close) = inner.find(')') {
            let digits = &inner[..close];
            if !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_digit())
                && inner[close + 1..].is_empty()
            {
                let base = token[..open].trim_end();
                if base.len() >= MIN_TOKEN {
                    return Some(base.to_string());
                }
            }
        }
    }

    // Numeric variant: "12345_2".
    if let Some((base, tail)) = token.rsplit_once('_') {
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) && base.len() >= MIN_TOKEN {
            return Some(base.to_string());
        }
    }

    // Descriptive suffix: "J1234567_DETAIL".
    for suffix in DESCRIPTIVE_SUFFIXES {
        if let Some(base) = token.strip_suffix(suffix) {
            if base.len() >= MIN_TOKEN {
                return Some(base.to_string());
            }
        }
    }

    // Revision letter tacked onto a numeric tail: "J1234567A".
    let mut chars = token.chars();
    if let Some(last) = chars.next_back() {
        if last.is_ascii_uppercase() {
            let base: String = chars.collect();
            if base.len() >= MIN_TOKEN && base.ends_with(|c: char| c.is_ascii_digit()) {
                return Some(base);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> MemoryCatalogLookup {
        let mut aliases = HashMap::new();
        aliases.insert("OLD12345".to_string(), "12345".to_string());
        MemoryCatalogLookup::new(
            vec!["J1234567".to_string(), "12345".to_string(), "A8805".to_string()],
            aliases,
        )
    }

    fn resolver() -> IdentifierResolver<MemoryCatalogLookup> {
        IdentifierResolver::new(lookup(), ResolverConfig::default())
    }

    #[test]
    fn direct_match_scores_full_confidence() {
        let mapping = resolver().resolve("J1234567.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::DirectMatch);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("J1234567"));
        assert_eq!(mapping.confidence_score, 1.0);
        assert!(!mapping.requires_manual_review);
    }

    #[test]
    fn numbered_variant_after_one_strip() {
        let mapping = resolver().resolve("J1234567_2.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::NumberedVariant);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("J1234567"));
        assert!(mapping.confidence_score >= 0.6 && mapping.confidence_score <= 0.8);
    }

    #[test]
    fn deeper_strips_score_lower() {
        let one = resolver().resolve("J1234567_2.jpg").unwrap();
        let two = resolver().resolve("J1234567_DETAIL_2.jpg").unwrap();
        assert_eq!(two.method, MappingMethod::NumberedVariant);
        assert!(two.confidence_score < one.confidence_score);
        assert!(two.confidence_score >= 0.6);
    }

    #[test]
    fn parenthetical_variant_matches() {
        let mapping = resolver().resolve("J1234567 (2).jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::NumberedVariant);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("J1234567"));
    }

    #[test]
    fn interchange_alias_resolves_and_records_source() {
        let mapping = resolver().resolve("OLD12345_1.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::InterchangeAlias);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("12345"));
        assert_eq!(mapping.alias_source.as_deref(), Some("OLD12345"));
        assert!(mapping.requires_manual_review);
    }

    #[test]
    fn unresolved_forces_review() {
        let mapping = resolver().resolve("vacation_photo.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::Unresolved);
        assert!(mapping.mapped_identifier.is_none());
        assert_eq!(mapping.confidence_score, 0.0);
        assert!(mapping.requires_manual_review);
    }

    #[test]
    fn tier_one_beats_tier_two_on_ambiguous_tokens() {
        // "A8805" is itself active; "A880" is not worth stripping toward.
        let lookup = MemoryCatalogLookup::new(
            vec!["A8805".to_string(), "A880".to_string()],
            HashMap::new(),
        );
        let resolver = IdentifierResolver::new(lookup, ResolverConfig::default());
        let mapping = resolver.resolve("A8805.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::DirectMatch);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("A8805"));
    }

    #[test]
    fn confidence_ordering_across_methods() {
        let direct = resolver().resolve("J1234567.jpg").unwrap();
        let variant = resolver().resolve("J1234567_3.jpg").unwrap();
        let alias = resolver().resolve("OLD12345.jpg").unwrap();
        let unresolved = resolver().resolve("zzzz.jpg").unwrap();

        assert!(direct.confidence_score > variant.confidence_score);
        assert!(variant.confidence_score > alias.confidence_score);
        assert!(alias.confidence_score >= unresolved.confidence_score);
        assert_eq!(unresolved.confidence_score, 0.0);
    }

    #[test]
    fn revision_letter_is_stripped() {
        let mapping = resolver().resolve("J1234567A.jpg").unwrap();
        assert_eq!(mapping.method, MappingMethod::NumberedVariant);
        assert_eq!(mapping.mapped_identifier.as_deref(), Some("J1234567"));
    }

    #[test]
    fn candidates_are_recorded_most_literal_first() {
        let mapping = resolver().resolve("J1234567_DETAIL_2.jpg").unwrap();
        assert_eq!(mapping.candidates[0], "J1234567_DETAIL_2");
        assert!(mapping.candidates.contains(&"J1234567".to_string()));
    }
}
