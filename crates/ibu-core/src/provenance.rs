//! Provenance and schema descriptors attached to unfolding outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic version describing the schema of serialized payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Major version incremented for breaking changes.
    pub major: u32,
    /// Minor version incremented for additive changes.
    pub minor: u32,
    /// Patch version incremented for bug fixes and documentation updates.
    pub patch: u32,
}

impl SchemaVersion {
    /// Creates a new schema version descriptor.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

/// Provenance information attached to every unfolding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunProvenance {
    /// Schema of the serialized run.
    pub schema_version: SchemaVersion,
    /// Hash of the configuration used to produce the run.
    pub config_hash: String,
    /// Hash of the response matrix, uncertainties and efficiencies.
    pub model_hash: String,
    /// Hash of the observed effect distribution.
    pub observed_hash: String,
    /// Master seed used for resampling, when any randomness was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Version map for all crates involved in the run.
    pub tool_versions: BTreeMap<String, String>,
}
