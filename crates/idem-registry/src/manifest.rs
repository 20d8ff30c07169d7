use serde::{Deserialize, Serialize};

use crate::RiskTier;

/// Manifest schema version understood by this crate.
pub const MANIFEST_VERSION: u32 = 1;

/// On-disk shape of the mutation manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub mutations: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub operation: String,
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub description: String,
}
