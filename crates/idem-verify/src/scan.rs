//! Source scanning: gated call sites and plain mutating route declarations.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use idem_registry::RiskTier;
use regex::Regex;
use walkdir::{DirEntry, WalkDir};

use crate::{VerifyError, VerifyResult};

pub const DEFAULT_EXTENSIONS: &[&str] = &["rs", "ts", "tsx", "js", "py"];

const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "dist", "build", "__pycache__"];

const GATE_CALL: &str = r#"\b(register_financial_route|registerFinancialRoute|register_high_risk_route|registerHighRiskRoute)\s*(?:::\s*<[^>]*>\s*)?\(\s*["']([^"'\s]+)["']"#;

const GATE_NAME: &str =
    r"\b(?:register_financial_route|registerFinancialRoute|register_high_risk_route|registerHighRiskRoute)\b";

// Express/Fastify `router.post('/x'`, FastAPI/Flask `@app.post("/x"`, axum
// `.route("/x", post(`.
const MUTATING_ROUTE: &str = r#"(?:\.(?:post|put|patch|delete)\s*\(\s*["'`]|\broute\s*\(\s*"[^"]*"\s*,\s*(?:post|put|patch|delete)\s*\()"#;

/// A call to one of the gate registration functions with a literal name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatedCallSite {
    pub file: String,
    pub line: usize,
    pub operation: String,
    pub tier: RiskTier,
}

/// A mutating route declared without a gate on the same line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecl {
    pub file: String,
    pub line: usize,
    pub text: String,
}

#[derive(Clone, Debug, Default)]
pub struct SourceScan {
    pub files_scanned: usize,
    pub call_sites: Vec<GatedCallSite>,
    pub ungated_routes: Vec<RouteDecl>,
}

pub struct Scanner {
    gate_call: Regex,
    gate_name: Regex,
    mutating_route: Regex,
    extensions: BTreeSet<String>,
}

impl Scanner {
    pub fn new<I, E>(extensions: I) -> VerifyResult<Self>
    where
        I: IntoIterator<Item = E>,
        E: AsRef<str>,
    {
        Ok(Self {
            gate_call: Regex::new(GATE_CALL)?,
            gate_name: Regex::new(GATE_NAME)?,
            mutating_route: Regex::new(MUTATING_ROUTE)?,
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        })
    }

    pub fn scan_tree(&self, root: &Path) -> VerifyResult<SourceScan> {
        let mut scan = SourceScan::default();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !skipped_dir(e));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() || !self.wants(entry.path()) {
                continue;
            }
            let path = entry.path();
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    tracing::debug!(path = %path.display(), "skipping non-UTF-8 file");
                    continue;
                }
                Err(source) => {
                    return Err(VerifyError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            self.scan_source(&display_path(root, path), &text, &mut scan);
        }
        tracing::debug!(
            files = scan.files_scanned,
            call_sites = scan.call_sites.len(),
            ungated_routes = scan.ungated_routes.len(),
            "source scan finished"
        );
        Ok(scan)
    }

    /// Scan one file's text; `file` is the name reported in diagnostics and
    /// picks the comment syntax. Commented-out code never counts.
    pub fn scan_source(&self, file: &str, text: &str, scan: &mut SourceScan) {
        scan.files_scanned += 1;
        let code = blank_comments(text, CommentSyntax::for_file(file));
        for caps in self.gate_call.captures_iter(&code) {
            let (Some(func), Some(name)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let tier = if func.as_str().contains("inancial") {
                RiskTier::Financial
            } else {
                RiskTier::HighRisk
            };
            scan.call_sites.push(GatedCallSite {
                file: file.to_string(),
                line: line_of(&code, func.start()),
                operation: name.as_str().to_string(),
                tier,
            });
        }
        for (idx, (code_line, line)) in code.lines().zip(text.lines()).enumerate() {
            if self.mutating_route.is_match(code_line) && !self.gate_name.is_match(code_line) {
                scan.ungated_routes.push(RouteDecl {
                    file: file.to_string(),
                    line: idx + 1,
                    text: line.trim().to_string(),
                });
            }
        }
    }

    fn wants(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }
}

fn skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommentSyntax {
    /// `//` and `/* */`; `'`, `"` and backtick strings.
    Slash,
    /// As `Slash`, but `'` opens a char literal or a lifetime.
    Rust,
    /// `#` to end of line.
    Hash,
}

impl CommentSyntax {
    fn for_file(file: &str) -> Self {
        match Path::new(file).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("py") => CommentSyntax::Hash,
            Some(ext) if ext.eq_ignore_ascii_case("rs") => CommentSyntax::Rust,
            _ => CommentSyntax::Slash,
        }
    }
}

/// Replace every comment byte except newlines with a space. Byte offsets and
/// line numbers of the result match `text`.
fn blank_comments(text: &str, syntax: CommentSyntax) -> String {
    let src = text.as_bytes();
    let mut out = src.to_vec();
    let mut blank = |from: usize, to: usize| {
        for b in &mut out[from..to] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    };
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q || (b == b'\n' && q != b'`') {
                quote = None;
            }
            i += 1;
            continue;
        }
        let next = src.get(i + 1).copied();
        match (syntax, b, next) {
            (_, b'"', _) => quote = Some(b),
            (CommentSyntax::Slash, b'\'' | b'`', _) | (CommentSyntax::Hash, b'\'', _) => {
                quote = Some(b)
            }
            (CommentSyntax::Rust, b'\'', _) => {
                if let Some(len) = rust_char_literal_len(text, i) {
                    i += len;
                    continue;
                }
            }
            (CommentSyntax::Hash, b'#', _)
            | (CommentSyntax::Slash | CommentSyntax::Rust, b'/', Some(b'/')) => {
                let end = src[i..]
                    .iter()
                    .position(|c| *c == b'\n')
                    .map_or(src.len(), |p| i + p);
                blank(i, end);
                i = end;
                continue;
            }
            (CommentSyntax::Slash | CommentSyntax::Rust, b'/', Some(b'*')) => {
                let end = text[i + 2..].find("*/").map_or(src.len(), |p| i + 2 + p + 2);
                blank(i, end);
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Length of a char literal starting at `start`, or `None` for a lifetime.
fn rust_char_literal_len(text: &str, start: usize) -> Option<usize> {
    let rest = &text[start + 1..];
    if let Some(escaped) = rest.strip_prefix('\\') {
        let close = escaped.char_indices().take(10).find(|(_, c)| *c == '\'')?.0;
        return Some(close + 3);
    }
    let ch = rest.chars().next()?;
    rest[ch.len_utf8()..]
        .starts_with('\'')
        .then_some(ch.len_utf8() + 2)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// `path` relative to `root` with `/` separators, or unchanged if outside it.
pub fn display_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> Scanner {
        Scanner::new(DEFAULT_EXTENSIONS).expect("scanner")
    }

    #[test]
    fn finds_gate_calls_in_both_naming_styles() {
        let mut scan = SourceScan::default();
        let source = r#"
const router = express.Router();
router.post('/invoices', gate.registerFinancialRoute('createInvoice', createInvoice));
router.post(
  '/payroll',
  gate.registerHighRiskRoute(
    "runPayroll",
    runPayroll,
  ),
);
"#;
        scanner().scan_source("routes/billing.ts", source, &mut scan);
        assert_eq!(
            scan.call_sites,
            vec![
                GatedCallSite {
                    file: "routes/billing.ts".into(),
                    line: 3,
                    operation: "createInvoice".into(),
                    tier: RiskTier::Financial,
                },
                GatedCallSite {
                    file: "routes/billing.ts".into(),
                    line: 6,
                    operation: "runPayroll".into(),
                    tier: RiskTier::HighRisk,
                },
            ]
        );
        assert!(scan.ungated_routes.is_empty());
    }

    #[test]
    fn rust_call_sites_with_turbofish() {
        let mut scan = SourceScan::default();
        let source = r#"
let app = Router::new()
    .route("/invoices", gate.register_financial_route::<(), _, _>("createInvoice", create)?)
    .route("/refunds", post(refund));
"#;
        scanner().scan_source("src/app.rs", source, &mut scan);
        assert_eq!(scan.call_sites.len(), 1);
        assert_eq!(scan.call_sites[0].operation, "createInvoice");
        assert_eq!(scan.call_sites[0].line, 3);
        assert_eq!(scan.ungated_routes.len(), 1);
        assert_eq!(scan.ungated_routes[0].line, 4);
        assert_eq!(
            scan.ungated_routes[0].text,
            r#".route("/refunds", post(refund));"#
        );
    }

    #[test]
    fn python_decorators_count_as_routes() {
        let mut scan = SourceScan::default();
        scanner().scan_source(
            "app/payroll.py",
            "@app.post(\"/payroll\")\ndef run_payroll():\n    pass\n",
            &mut scan,
        );
        assert_eq!(scan.ungated_routes.len(), 1);
        assert_eq!(scan.ungated_routes[0].line, 1);
    }

    #[test]
    fn commented_out_gate_is_not_a_gate() {
        let mut scan = SourceScan::default();
        let source = "\
// router.post('/bank-transfers', gate.registerFinancialRoute('createBankTransfer', h));
router.post('/bank-transfers', createBankTransfer);
/*
router.post('/refunds', gate.registerFinancialRoute('createRefund', h));
*/
router.post('/invoices', gate.registerFinancialRoute('createInvoice', h)); // gated
";
        scanner().scan_source("routes/bank.ts", source, &mut scan);
        assert_eq!(scan.call_sites.len(), 1);
        assert_eq!(scan.call_sites[0].operation, "createInvoice");
        assert_eq!(scan.call_sites[0].line, 6);
        assert_eq!(
            scan.ungated_routes,
            vec![RouteDecl {
                file: "routes/bank.ts".into(),
                line: 2,
                text: "router.post('/bank-transfers', createBankTransfer);".into(),
            }]
        );
    }

    #[test]
    fn comment_markers_inside_strings_and_lifetimes_are_code() {
        let mut scan = SourceScan::default();
        scanner().scan_source(
            "routes/hooks.js",
            "router.post('http://hooks/in', gate.registerHighRiskRoute('runPayroll', h));\n",
            &mut scan,
        );
        scanner().scan_source(
            "src/app.rs",
            "fn app<'a>(g: &'a Gate) { let c = '/'; g.register_financial_route(\"createInvoice\", h); }\n",
            &mut scan,
        );
        scanner().scan_source(
            "app/payroll.py",
            "# gate.register_high_risk_route(\"runPayroll\", h)\n\
             app.post(\"/tag#1\", gate.register_financial_route(\"createInvoice\", h))\n",
            &mut scan,
        );
        let found: Vec<_> = scan
            .call_sites
            .iter()
            .map(|c| (c.file.as_str(), c.line, c.operation.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("routes/hooks.js", 1, "runPayroll"),
                ("src/app.rs", 1, "createInvoice"),
                ("app/payroll.py", 2, "createInvoice"),
            ]
        );
        assert!(scan.ungated_routes.is_empty());
    }

    #[test]
    fn extension_filter_and_skipped_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("routes")).expect("mkdir");
        fs::create_dir_all(root.join("node_modules/lib")).expect("mkdir");
        fs::write(
            root.join("routes/a.ts"),
            "gate.registerFinancialRoute('createInvoice', h);\n",
        )
        .expect("write");
        fs::write(
            root.join("routes/notes.md"),
            "gate.registerFinancialRoute('documented', h);\n",
        )
        .expect("write");
        fs::write(
            root.join("node_modules/lib/index.js"),
            "gate.registerFinancialRoute('vendored', h);\n",
        )
        .expect("write");

        let scan = scanner().scan_tree(root).expect("scan");
        assert_eq!(scan.files_scanned, 1);
        assert_eq!(scan.call_sites.len(), 1);
        assert_eq!(scan.call_sites[0].file, "routes/a.ts");
    }
}
