//! Static catalog of mutating operations and their risk classification.
//!
//! The catalog is loaded once from a single JSON manifest. Both the runtime
//! route gate and the offline contract verifier read the same file, so an
//! operation that is missing from the manifest is rejected at startup and
//! flagged in CI.

mod manifest;

pub use manifest::{MANIFEST_VERSION, Manifest, ManifestEntry};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Risk classification attached to an operation; decides which gate wraps it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Financial,
    HighRisk,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Financial => "FINANCIAL",
            RiskTier::HighRisk => "HIGH_RISK",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FINANCIAL" => Ok(RiskTier::Financial),
            "HIGH_RISK" => Ok(RiskTier::HighRisk),
            other => Err(RegistryError::UnknownTier(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationDescriptor {
    pub operation_name: String,
    pub risk_tier: RiskTier,
    pub required_permissions: BTreeSet<String>,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("I/O error reading manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported manifest version {found}, expected {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("duplicate operation '{0}' in manifest")]
    DuplicateOperation(String),
    #[error("invalid operation name '{0}'")]
    InvalidOperationName(String),
    #[error("unknown risk tier '{0}'")]
    UnknownTier(String),
    #[error("operation '{0}' is not registered")]
    NotFound(String),
}

/// Immutable operation catalog. Share it as `Arc<Registry>`.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    version: u32,
    entries: BTreeMap<String, MutationDescriptor>,
}

impl Registry {
    pub fn from_path(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> RegistryResult<Self> {
        let manifest: Manifest = serde_json::from_str(text)?;
        Self::from_manifest(manifest)
    }

    pub fn from_manifest(manifest: Manifest) -> RegistryResult<Self> {
        if manifest.version != MANIFEST_VERSION {
            return Err(RegistryError::UnsupportedVersion {
                found: manifest.version,
                supported: MANIFEST_VERSION,
            });
        }
        let mut entries = BTreeMap::new();
        for entry in manifest.mutations {
            if !is_valid_operation_name(&entry.operation) {
                return Err(RegistryError::InvalidOperationName(entry.operation));
            }
            let descriptor = MutationDescriptor {
                operation_name: entry.operation.clone(),
                risk_tier: entry.risk_tier,
                required_permissions: entry.permissions.into_iter().collect(),
                description: entry.description,
            };
            if entries.insert(entry.operation.clone(), descriptor).is_some() {
                return Err(RegistryError::DuplicateOperation(entry.operation));
            }
        }
        Ok(Self {
            version: manifest.version,
            entries,
        })
    }

    pub fn lookup(&self, operation_name: &str) -> RegistryResult<&MutationDescriptor> {
        self.entries
            .get(operation_name)
            .ok_or_else(|| RegistryError::NotFound(operation_name.to_string()))
    }

    pub fn contains(&self, operation_name: &str) -> bool {
        self.entries.contains_key(operation_name)
    }

    /// Descriptors in operation-name order.
    pub fn iter(&self) -> impl Iterator<Item = &MutationDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

fn is_valid_operation_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "version": 1,
        "mutations": [
            {
                "operation": "createInvoice",
                "risk_tier": "FINANCIAL",
                "permissions": ["invoices:write"],
                "description": "Issue a customer invoice"
            },
            {
                "operation": "runPayroll",
                "risk_tier": "HIGH_RISK",
                "permissions": ["payroll:run", "payroll:approve"]
            }
        ]
    }"#;

    #[test]
    fn lookup_returns_descriptor() {
        let registry = Registry::from_json_str(MANIFEST).expect("load");
        assert_eq!(registry.len(), 2);
        let invoice = registry.lookup("createInvoice").expect("lookup");
        assert_eq!(invoice.risk_tier, RiskTier::Financial);
        assert!(invoice.required_permissions.contains("invoices:write"));
        let payroll = registry.lookup("runPayroll").expect("lookup");
        assert_eq!(payroll.risk_tier, RiskTier::HighRisk);
        assert_eq!(payroll.required_permissions.len(), 2);
        assert!(payroll.description.is_empty());
    }

    #[test]
    fn missing_operation_is_not_found() {
        let registry = Registry::from_json_str(MANIFEST).expect("load");
        let err = registry.lookup("deleteTenant").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(name) if name == "deleteTenant"));
    }

    #[test]
    fn duplicate_operation_is_rejected() {
        let text = r#"{"version":1,"mutations":[
            {"operation":"a","risk_tier":"FINANCIAL"},
            {"operation":"a","risk_tier":"HIGH_RISK"}
        ]}"#;
        let err = Registry::from_json_str(text).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateOperation(name) if name == "a"));
    }

    #[test]
    fn unknown_tier_and_version_are_rejected() {
        let bad_tier = r#"{"version":1,"mutations":[{"operation":"a","risk_tier":"LOW"}]}"#;
        assert!(matches!(
            Registry::from_json_str(bad_tier).unwrap_err(),
            RegistryError::Decode(_)
        ));
        let bad_version = r#"{"version":7,"mutations":[]}"#;
        assert!(matches!(
            Registry::from_json_str(bad_version).unwrap_err(),
            RegistryError::UnsupportedVersion { found: 7, supported: 1 }
        ));
    }

    #[test]
    fn whitespace_in_name_is_rejected() {
        let text = r#"{"version":1,"mutations":[{"operation":"create invoice","risk_tier":"FINANCIAL"}]}"#;
        assert!(matches!(
            Registry::from_json_str(text).unwrap_err(),
            RegistryError::InvalidOperationName(_)
        ));
    }

    #[test]
    fn tier_parses_from_manifest_spelling() {
        assert_eq!("HIGH_RISK".parse::<RiskTier>().unwrap(), RiskTier::HighRisk);
        assert_eq!(RiskTier::Financial.to_string(), "FINANCIAL");
        assert!("financial".parse::<RiskTier>().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mutations.json");
        std::fs::write(&path, MANIFEST).expect("write");
        let registry = Registry::from_path(&path).expect("load");
        let names: Vec<_> = registry.iter().map(|d| d.operation_name.as_str()).collect();
        assert_eq!(names, vec!["createInvoice", "runPayroll"]);
        assert_eq!(registry.version(), 1);
    }
}
