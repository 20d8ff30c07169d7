//! Offline check that the mutation manifest and the gated routes in a source
//! tree agree.
//!
//! Three kinds of drift are reported, each as `<file>:<line>: <message>`:
//! - an operation in the manifest with no gated call site;
//! - a gated call site naming an operation the manifest does not have;
//! - a call site using the gate for a different risk tier than the manifest
//!   assigns.

pub mod scan;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use idem_registry::{Registry, RegistryError, RiskTier};
use regex::Regex;

pub use scan::{DEFAULT_EXTENSIONS, GatedCallSite, RouteDecl, Scanner, SourceScan, display_path};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type VerifyResult<T> = Result<T, VerifyError>;

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub manifest: PathBuf,
    pub root: PathBuf,
    pub extensions: Vec<String>,
}

impl VerifyOptions {
    pub fn new(manifest: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationKind {
    RegisteredNotGated,
    GatedNotRegistered,
    TierMismatch { registered: RiskTier, gated: RiskTier },
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::RegisteredNotGated => "registered_not_gated",
            ViolationKind::GatedNotRegistered => "gated_not_registered",
            ViolationKind::TierMismatch { .. } => "tier_mismatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Violation {
    pub file: String,
    pub line: usize,
    pub operation: String,
    pub kind: ViolationKind,
}

impl Violation {
    pub fn message(&self) -> String {
        match &self.kind {
            ViolationKind::RegisteredNotGated => {
                format!("operation \"{}\" is registered but not gated", self.operation)
            }
            ViolationKind::GatedNotRegistered => {
                format!("operation \"{}\" is gated but not registered", self.operation)
            }
            ViolationKind::TierMismatch { registered, gated } => format!(
                "operation \"{}\" is {registered} but gated as {gated}",
                self.operation
            ),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub registered: usize,
    pub call_sites: usize,
    pub files_scanned: usize,
    pub violations: Vec<Violation>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": self.is_clean(),
            "registered": self.registered,
            "call_sites": self.call_sites,
            "files_scanned": self.files_scanned,
            "violations": self.violations.iter().map(|v| serde_json::json!({
                "file": v.file,
                "line": v.line,
                "operation": v.operation,
                "kind": v.kind.as_str(),
                "message": v.message(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// The manifest as loaded, kept so diagnostics can point at its lines.
pub struct ManifestSource {
    pub display: String,
    pub text: String,
}

impl ManifestSource {
    fn line_of(&self, operation: &str) -> usize {
        let needle = format!("\"{operation}\"");
        self.text
            .lines()
            .position(|l| l.contains(&needle))
            .map(|i| i + 1)
            .unwrap_or(1)
    }
}

pub fn verify(options: &VerifyOptions) -> VerifyResult<Report> {
    let (registry, manifest) = load_manifest(&options.manifest, &options.root)?;
    let scanner = Scanner::new(&options.extensions)?;
    let scan = scanner.scan_tree(&options.root)?;
    check(&registry, &scan, &manifest)
}

/// Compare a registry with a finished scan.
pub fn check(
    registry: &Registry,
    scan: &SourceScan,
    manifest: &ManifestSource,
) -> VerifyResult<Report> {
    let mut violations = Vec::new();
    let mut gated = BTreeSet::new();
    for site in &scan.call_sites {
        gated.insert(site.operation.as_str());
        match registry.lookup(&site.operation) {
            Err(_) => violations.push(Violation {
                file: site.file.clone(),
                line: site.line,
                operation: site.operation.clone(),
                kind: ViolationKind::GatedNotRegistered,
            }),
            Ok(descriptor) if descriptor.risk_tier != site.tier => violations.push(Violation {
                file: site.file.clone(),
                line: site.line,
                operation: site.operation.clone(),
                kind: ViolationKind::TierMismatch {
                    registered: descriptor.risk_tier,
                    gated: site.tier,
                },
            }),
            Ok(_) => {}
        }
    }

    for descriptor in registry.iter() {
        let name = descriptor.operation_name.as_str();
        if gated.contains(name) {
            continue;
        }
        let mention = mention_pattern(name)?;
        let (file, line) = match scan
            .ungated_routes
            .iter()
            .find(|route| mention.is_match(&route.text))
        {
            Some(route) => (route.file.clone(), route.line),
            None => (manifest.display.clone(), manifest.line_of(name)),
        };
        violations.push(Violation {
            file,
            line,
            operation: name.to_string(),
            kind: ViolationKind::RegisteredNotGated,
        });
    }

    violations.sort();
    for violation in &violations {
        tracing::debug!(%violation, "contract violation");
    }
    Ok(Report {
        registered: registry.len(),
        call_sites: scan.call_sites.len(),
        files_scanned: scan.files_scanned,
        violations,
    })
}

/// Matches the operation name as written or in its snake/camel spelling.
fn mention_pattern(operation: &str) -> VerifyResult<Regex> {
    let mut spellings = vec![
        operation.to_string(),
        to_snake_case(operation),
        to_camel_case(operation),
    ];
    spellings.sort();
    spellings.dedup();
    let alternatives: Vec<String> = spellings.iter().map(|s| regex::escape(s)).collect();
    Ok(Regex::new(&format!(r"\b(?:{})\b", alternatives.join("|")))?)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Read the manifest, keeping its text for line lookups.
pub fn load_manifest(path: &Path, root: &Path) -> VerifyResult<(Registry, ManifestSource)> {
    let text = fs::read_to_string(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let registry = Registry::from_json_str(&text)?;
    Ok((
        registry,
        ManifestSource {
            display: display_path(root, path),
            text,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
  "version": 1,
  "mutations": [
    {"operation": "createInvoice", "risk_tier": "FINANCIAL"},
    {"operation": "runPayroll", "risk_tier": "HIGH_RISK"},
    {"operation": "createBankTransfer", "risk_tier": "FINANCIAL"}
  ]
}"#;

    fn manifest() -> (Registry, ManifestSource) {
        (
            Registry::from_json_str(MANIFEST).expect("registry"),
            ManifestSource {
                display: "mutations.json".into(),
                text: MANIFEST.into(),
            },
        )
    }

    fn scan(files: &[(&str, &str)]) -> SourceScan {
        let scanner = Scanner::new(DEFAULT_EXTENSIONS).expect("scanner");
        let mut scan = SourceScan::default();
        for (file, text) in files {
            scanner.scan_source(file, text, &mut scan);
        }
        scan
    }

    #[test]
    fn case_conversions() {
        assert_eq!(to_snake_case("createBankTransfer"), "create_bank_transfer");
        assert_eq!(to_snake_case("run_payroll"), "run_payroll");
        assert_eq!(to_camel_case("run_payroll"), "runPayroll");
        assert_eq!(to_camel_case("createInvoice"), "createInvoice");
    }

    #[test]
    fn reports_all_three_kinds() {
        let (registry, manifest) = manifest();
        let scan = scan(&[(
            "routes/api.ts",
            "router.post('/invoices', gate.registerHighRiskRoute('createInvoice', h));\n\
             router.post('/payroll', gate.registerHighRiskRoute('runPayroll', h));\n\
             router.post('/refunds', gate.registerFinancialRoute('issueRefund', h));\n",
        )]);
        let report = check(&registry, &scan, &manifest).expect("check");
        let lines: Vec<String> = report.violations.iter().map(|v| v.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                r#"mutations.json:6: operation "createBankTransfer" is registered but not gated"#,
                r#"routes/api.ts:1: operation "createInvoice" is FINANCIAL but gated as HIGH_RISK"#,
                r#"routes/api.ts:3: operation "issueRefund" is gated but not registered"#,
            ]
        );
        assert_eq!(report.registered, 3);
        assert_eq!(report.call_sites, 3);
    }

    #[test]
    fn ungated_route_mentioning_snake_case_name_is_the_location() {
        let (registry, manifest) = manifest();
        let scan = scan(&[
            (
                "src/routes.rs",
                ".route(\"/invoices\", gate.register_financial_route(\"createInvoice\", h)?)\n\
                 .route(\"/payroll\", gate.register_high_risk_route(\"runPayroll\", h)?)\n\
                 .route(\"/transfers/draft\", post(create_bank_transfer_draft))\n\
                 .route(\"/transfers\", post(create_bank_transfer))\n",
            ),
        ]);
        let report = check(&registry, &scan, &manifest).expect("check");
        assert_eq!(report.violations.len(), 1);
        assert_eq!(
            report.violations[0].to_string(),
            r#"src/routes.rs:4: operation "createBankTransfer" is registered but not gated"#
        );
    }

    #[test]
    fn json_report_shape() {
        let (registry, manifest) = manifest();
        let report = check(&registry, &SourceScan::default(), &manifest).expect("check");
        let json = report.to_json();
        assert_eq!(json["ok"], false);
        assert_eq!(json["violations"].as_array().map(Vec::len), Some(3));
        assert_eq!(json["violations"][0]["kind"], "registered_not_gated");
    }
}
