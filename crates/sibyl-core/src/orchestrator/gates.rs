//! Quality gate runner: executes lint, typecheck, test, and security
//! commands in a worktree.
//!
//! Project types are detected by manifest file in strict order (Python,
//! then TypeScript, then Rust, then Go). Commands prefer project-declared
//! scripts (package.json for TypeScript), then locally available tools.
//! Every command runs under a 300-second timeout with output truncated to
//! 100 lines.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::entity::records::QualityGateType;

/// Wall-time limit per gate command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Output cap before truncation.
const MAX_OUTPUT_LINES: usize = 100;
/// Error cap for lint/typecheck parsers.
const MAX_PARSED_ERRORS: usize = 50;
/// Error cap for test/security parsers.
const MAX_PARSED_FAILURES: usize = 20;

/// Detected project type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Python,
    Typescript,
    Rust,
    Go,
    Unknown,
}

/// Resolved command set for one worktree.
#[derive(Debug, Clone)]
pub struct ProjectProfile {
    pub kind: ProjectKind,
    pub root: PathBuf,
    pub lint_command: Option<String>,
    pub typecheck_command: Option<String>,
    pub test_command: Option<String>,
    pub security_command: Option<String>,
}

/// Result of running one quality gate.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub gate_type: QualityGateType,
    pub passed: bool,
    pub output: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: Map<String, Value>,
    pub duration_ms: u64,
}

impl GateResult {
    /// A passing result for gates with nothing to run.
    pub fn skipped(gate_type: QualityGateType, reason: &str) -> Self {
        Self {
            gate_type,
            passed: true,
            output: reason.to_owned(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: Map::new(),
            duration_ms: 0,
        }
    }

    /// Serialize for storage on the orchestrator record.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "gate_type": self.gate_type.to_string(),
            "passed": self.passed,
            "output": self.output,
            "errors": self.errors,
            "warnings": self.warnings,
            "metrics": self.metrics,
            "duration_ms": self.duration_ms,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Seam between the orchestrator and gate execution: production uses
/// [`QualityGateRunner`]; tests script verdicts.
#[async_trait]
pub trait GateExecutor: Send + Sync {
    async fn run_gate(&self, gate: QualityGateType, worktree: &Path) -> GateResult;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GateExecutor) {}
};

// ---------------------------------------------------------------------------
// Command plumbing
// ---------------------------------------------------------------------------

/// Result of one shell command.
#[derive(Debug, Clone)]
struct CommandResult {
    return_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandResult {
    fn success(&self) -> bool {
        self.return_code == 0
    }

    fn combined_output(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.trim().is_empty() {
            parts.push(self.stdout.trim().to_owned());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(self.stderr.trim().to_owned());
        }
        parts.join("\n")
    }
}

fn truncate_output(output: &str) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() <= MAX_OUTPUT_LINES {
        return output.to_owned();
    }
    let mut truncated: Vec<String> = lines[..MAX_OUTPUT_LINES]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    truncated.push(format!(
        "... (truncated {} more lines)",
        lines.len() - MAX_OUTPUT_LINES
    ));
    truncated.join("\n")
}

async fn run_command(command: &str, cwd: &Path) -> CommandResult {
    debug!(command, cwd = %cwd.display(), "running gate command");

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(COMMAND_TIMEOUT, spawned).await {
        Ok(Ok(output)) => CommandResult {
            return_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
        },
        Ok(Err(e)) => CommandResult {
            return_code: -1,
            stdout: String::new(),
            stderr: format!("Execution error: {e}"),
        },
        Err(_elapsed) => {
            warn!(command, "gate command timed out");
            CommandResult {
                return_code: -1,
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            }
        }
    }
}

async fn command_available(cmd: &str, cwd: &Path) -> bool {
    Command::new("which")
        .arg(cmd)
        .current_dir(cwd)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Project detection
// ---------------------------------------------------------------------------

/// Detect the project type and resolve gate commands for a worktree.
pub async fn detect_project(root: &Path) -> ProjectProfile {
    let mut profile = ProjectProfile {
        kind: ProjectKind::Unknown,
        root: root.to_path_buf(),
        lint_command: None,
        typecheck_command: None,
        test_command: None,
        security_command: None,
    };

    // Strict detection order: Python, TypeScript, Rust, Go.
    if root.join("pyproject.toml").exists() {
        profile.kind = ProjectKind::Python;
        configure_python(&mut profile).await;
    } else if root.join("package.json").exists() {
        profile.kind = ProjectKind::Typescript;
        configure_typescript(&mut profile).await;
    } else if root.join("Cargo.toml").exists() {
        profile.kind = ProjectKind::Rust;
        configure_rust(&mut profile).await;
    } else if root.join("go.mod").exists() {
        profile.kind = ProjectKind::Go;
        configure_go(&mut profile).await;
    }

    info!(
        kind = ?profile.kind,
        lint = ?profile.lint_command,
        typecheck = ?profile.typecheck_command,
        test = ?profile.test_command,
        "detected project profile"
    );
    profile
}

async fn configure_python(profile: &mut ProjectProfile) {
    let root = profile.root.clone();
    if command_available("ruff", &root).await {
        profile.lint_command = Some("ruff check .".to_owned());
    } else if command_available("flake8", &root).await {
        profile.lint_command = Some("flake8 .".to_owned());
    }

    if command_available("mypy", &root).await {
        profile.typecheck_command = Some("mypy .".to_owned());
    } else if command_available("pyright", &root).await {
        profile.typecheck_command = Some("pyright .".to_owned());
    }

    if command_available("pytest", &root).await {
        profile.test_command = Some("pytest -v".to_owned());
    } else {
        profile.test_command = Some("python -m unittest discover -v".to_owned());
    }

    if command_available("bandit", &root).await {
        profile.security_command = Some("bandit -r . -f json".to_owned());
    }
}

async fn configure_typescript(profile: &mut ProjectProfile) {
    let root = profile.root.clone();
    let pkg_runner = if root.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if root.join("yarn.lock").exists() {
        "yarn"
    } else {
        "npm"
    };

    let scripts: Map<String, Value> = std::fs::read_to_string(root.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|pkg| pkg.get("scripts").and_then(Value::as_object).cloned())
        .unwrap_or_default();

    if scripts.contains_key("lint") {
        profile.lint_command = Some(format!("{pkg_runner} run lint"));
    } else if command_available("eslint", &root).await {
        profile.lint_command = Some("eslint . --ext .ts,.tsx,.js,.jsx".to_owned());
    } else if command_available("biome", &root).await {
        profile.lint_command = Some("biome check .".to_owned());
    }

    if scripts.contains_key("typecheck") {
        profile.typecheck_command = Some(format!("{pkg_runner} run typecheck"));
    } else if scripts.contains_key("type-check") {
        profile.typecheck_command = Some(format!("{pkg_runner} run type-check"));
    } else if command_available("tsc", &root).await {
        profile.typecheck_command = Some("tsc --noEmit".to_owned());
    }

    if scripts.contains_key("test") {
        profile.test_command = Some(format!("{pkg_runner} run test"));
    } else if command_available("vitest", &root).await {
        profile.test_command = Some("vitest run".to_owned());
    } else if command_available("jest", &root).await {
        profile.test_command = Some("jest".to_owned());
    }
}

async fn configure_rust(profile: &mut ProjectProfile) {
    profile.lint_command = Some("cargo clippy -- -D warnings".to_owned());
    // Type checking is part of compilation.
    profile.typecheck_command = Some("cargo check".to_owned());
    profile.test_command = Some("cargo test".to_owned());
    if command_available("cargo-audit", &profile.root.clone()).await {
        profile.security_command = Some("cargo audit".to_owned());
    }
}

async fn configure_go(profile: &mut ProjectProfile) {
    let root = profile.root.clone();
    if command_available("golangci-lint", &root).await {
        profile.lint_command = Some("golangci-lint run".to_owned());
    } else {
        profile.lint_command = Some("go vet ./...".to_owned());
    }
    profile.typecheck_command = Some("go build ./...".to_owned());
    profile.test_command = Some("go test -v ./...".to_owned());
    if command_available("gosec", &root).await {
        profile.security_command = Some("gosec ./...".to_owned());
    }
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

fn parse_lint_errors(output: &str, kind: ProjectKind) -> Vec<String> {
    let lines = output.split('\n');
    let errors: Vec<String> = match kind {
        // Ruff format: path:line:col: CODE message
        ProjectKind::Python => lines
            .filter(|line| {
                let mut parts = line.splitn(4, ':');
                parts.next().is_some_and(|p| !p.trim().is_empty())
                    && parts.next().is_some_and(|p| p.parse::<u32>().is_ok())
                    && parts.next().is_some_and(|p| p.parse::<u32>().is_ok())
            })
            .map(|l| l.trim().to_owned())
            .collect(),
        // ESLint format: "  12:3  error  message  rule"
        ProjectKind::Typescript => lines
            .filter(|line| {
                let trimmed = line.trim_start();
                trimmed
                    .split(':')
                    .next()
                    .is_some_and(|p| p.parse::<u32>().is_ok())
            })
            .map(|l| l.trim().to_owned())
            .collect(),
        // Rustc/clippy diagnostics lead with "error[" or "error:".
        ProjectKind::Rust => lines
            .filter(|line| line.trim_start().starts_with("error"))
            .map(|l| l.trim().to_owned())
            .collect(),
        _ => Vec::new(),
    };
    errors.into_iter().take(MAX_PARSED_ERRORS).collect()
}

fn parse_typecheck_errors(output: &str, kind: ProjectKind) -> Vec<String> {
    let lines = output.split('\n');
    let errors: Vec<String> = match kind {
        // Mypy format: path:line: error: message
        ProjectKind::Python => lines
            .filter(|line| line.contains(": error:"))
            .map(|l| l.trim().to_owned())
            .collect(),
        // tsc format: path(line,col): error TS1234: message
        ProjectKind::Typescript => lines
            .filter(|line| line.contains("error TS"))
            .map(|l| l.trim().to_owned())
            .collect(),
        ProjectKind::Rust => lines
            .filter(|line| line.trim_start().starts_with("error"))
            .map(|l| l.trim().to_owned())
            .collect(),
        _ => Vec::new(),
    };
    errors.into_iter().take(MAX_PARSED_ERRORS).collect()
}

fn parse_test_failures(output: &str, kind: ProjectKind) -> Vec<String> {
    let lines = output.split('\n');
    let errors: Vec<String> = match kind {
        ProjectKind::Python => lines
            .filter(|line| line.trim().starts_with("FAILED"))
            .map(|l| l.trim().to_owned())
            .collect(),
        ProjectKind::Rust => lines
            .filter(|line| line.trim_end().ends_with("... FAILED"))
            .map(|l| l.trim().to_owned())
            .collect(),
        ProjectKind::Go => lines
            .filter(|line| line.trim_start().starts_with("--- FAIL"))
            .map(|l| l.trim().to_owned())
            .collect(),
        _ => Vec::new(),
    };
    errors.into_iter().take(MAX_PARSED_FAILURES).collect()
}

fn parse_test_metrics(output: &str, kind: ProjectKind) -> Map<String, Value> {
    let mut metrics = Map::new();
    if kind == ProjectKind::Python {
        // Pytest summary: "X passed, Y failed in N.NNs"
        for (key, suffix) in [("passed", " passed"), ("failed", " failed")] {
            if let Some(pos) = output.find(suffix) {
                let prefix = &output[..pos];
                if let Some(count) = prefix
                    .split_whitespace()
                    .last()
                    .and_then(|n| n.parse::<u64>().ok())
                {
                    metrics.insert(key.to_owned(), Value::from(count));
                }
            }
        }
    }
    metrics
}

/// Security findings split by severity. Only high/critical fail the gate.
fn parse_security_findings(output: &str, kind: ProjectKind) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if kind == ProjectKind::Python {
        for line in output.split('\n') {
            if line.contains("Severity: High") || line.contains("Severity: Critical") {
                errors.push(line.trim().to_owned());
            } else if line.contains("Severity: Medium") || line.contains("Severity: Low") {
                warnings.push(line.trim().to_owned());
            }
        }
    }

    errors.truncate(MAX_PARSED_FAILURES);
    warnings.truncate(MAX_PARSED_FAILURES);
    (errors, warnings)
}

// ---------------------------------------------------------------------------
// QualityGateRunner
// ---------------------------------------------------------------------------

/// Production gate executor: detects the project in the worktree and runs
/// the resolved command for each gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct QualityGateRunner;

impl QualityGateRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run_lint(&self, profile: &ProjectProfile) -> GateResult {
        let Some(command) = &profile.lint_command else {
            return GateResult::skipped(
                QualityGateType::Lint,
                "No lint command configured for this project type",
            );
        };
        let start = Instant::now();
        let result = run_command(command, &profile.root).await;
        let output = result.combined_output();
        GateResult {
            gate_type: QualityGateType::Lint,
            passed: result.success(),
            errors: parse_lint_errors(&output, profile.kind),
            warnings: Vec::new(),
            metrics: Map::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            output,
        }
    }

    async fn run_typecheck(&self, profile: &ProjectProfile) -> GateResult {
        let Some(command) = &profile.typecheck_command else {
            return GateResult::skipped(
                QualityGateType::Typecheck,
                "No typecheck command configured for this project type",
            );
        };
        let start = Instant::now();
        let result = run_command(command, &profile.root).await;
        let output = result.combined_output();
        GateResult {
            gate_type: QualityGateType::Typecheck,
            passed: result.success(),
            errors: parse_typecheck_errors(&output, profile.kind),
            warnings: Vec::new(),
            metrics: Map::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            output,
        }
    }

    async fn run_test(&self, profile: &ProjectProfile) -> GateResult {
        let Some(command) = &profile.test_command else {
            return GateResult::skipped(
                QualityGateType::Test,
                "No test command configured for this project type",
            );
        };
        let start = Instant::now();
        let result = run_command(command, &profile.root).await;
        let output = result.combined_output();
        GateResult {
            gate_type: QualityGateType::Test,
            passed: result.success(),
            errors: parse_test_failures(&output, profile.kind),
            warnings: Vec::new(),
            metrics: parse_test_metrics(&output, profile.kind),
            duration_ms: start.elapsed().as_millis() as u64,
            output,
        }
    }

    async fn run_security(&self, profile: &ProjectProfile) -> GateResult {
        let Some(command) = &profile.security_command else {
            return GateResult::skipped(
                QualityGateType::SecurityScan,
                "No security scanner configured for this project type",
            );
        };
        let start = Instant::now();
        let result = run_command(command, &profile.root).await;
        let output = result.combined_output();
        let (errors, warnings) = parse_security_findings(&output, profile.kind);
        // Scanners exit non-zero for any finding; only high/critical fail.
        GateResult {
            gate_type: QualityGateType::SecurityScan,
            passed: errors.is_empty(),
            errors,
            warnings,
            metrics: Map::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            output,
        }
    }
}

#[async_trait]
impl GateExecutor for QualityGateRunner {
    async fn run_gate(&self, gate: QualityGateType, worktree: &Path) -> GateResult {
        let profile = detect_project(worktree).await;
        match gate {
            QualityGateType::Lint => self.run_lint(&profile).await,
            QualityGateType::Typecheck => self.run_typecheck(&profile).await,
            QualityGateType::Test => self.run_test(&profile).await,
            QualityGateType::SecurityScan => self.run_security(&profile).await,
            // AI review is run by a separately-spawned reviewer agent; the
            // executor reports a pass when no reviewer is configured.
            QualityGateType::AiReview => {
                GateResult::skipped(QualityGateType::AiReview, "No reviewer agent configured")
            }
            // Human review never runs here.
            QualityGateType::HumanReview => GateResult::skipped(
                QualityGateType::HumanReview,
                "Human review is handled by the orchestrator",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_rust_project() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package]\nname='x'\n").unwrap();

        let profile = detect_project(tmp.path()).await;
        assert_eq!(profile.kind, ProjectKind::Rust);
        assert_eq!(
            profile.lint_command.as_deref(),
            Some("cargo clippy -- -D warnings")
        );
        assert_eq!(profile.typecheck_command.as_deref(), Some("cargo check"));
        assert_eq!(profile.test_command.as_deref(), Some("cargo test"));
    }

    #[tokio::test]
    async fn detection_order_prefers_python() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pyproject.toml"), "[project]\n").unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package]\n").unwrap();

        let profile = detect_project(tmp.path()).await;
        assert_eq!(profile.kind, ProjectKind::Python);
    }

    #[tokio::test]
    async fn typescript_prefers_package_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"scripts": {"lint": "eslint .", "typecheck": "tsc --noEmit", "test": "vitest"}}"#,
        )
        .unwrap();

        let profile = detect_project(tmp.path()).await;
        assert_eq!(profile.kind, ProjectKind::Typescript);
        assert_eq!(profile.lint_command.as_deref(), Some("npm run lint"));
        assert_eq!(profile.typecheck_command.as_deref(), Some("npm run typecheck"));
        assert_eq!(profile.test_command.as_deref(), Some("npm run test"));
    }

    #[tokio::test]
    async fn unknown_project_skips_gates() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = QualityGateRunner::new();
        let result = runner.run_gate(QualityGateType::Lint, tmp.path()).await;
        assert!(result.passed);
        assert!(result.output.contains("No lint command"));
    }

    #[tokio::test]
    async fn command_success_and_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = run_command("true", tmp.path()).await;
        assert!(ok.success());

        let fail = run_command("false", tmp.path()).await;
        assert!(!fail.success());

        let output = run_command("echo hello", tmp.path()).await;
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn truncation_appends_marker() {
        let long = (0..250).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let truncated = truncate_output(&long);
        let lines: Vec<&str> = truncated.split('\n').collect();
        assert_eq!(lines.len(), MAX_OUTPUT_LINES + 1);
        assert!(lines.last().unwrap().contains("truncated 150 more lines"));
    }

    #[test]
    fn truncation_leaves_short_output_alone() {
        assert_eq!(truncate_output("a\nb"), "a\nb");
    }

    #[test]
    fn parse_python_lint_errors() {
        let output = "src/app.py:10:5: E501 line too long\nAll checks passed\nsrc/b.py:2:1: F401 unused";
        let errors = parse_lint_errors(output, ProjectKind::Python);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("E501"));
    }

    #[test]
    fn parse_mypy_errors() {
        let output = "src/app.py:10: error: Incompatible types\nSuccess: no issues";
        let errors = parse_typecheck_errors(output, ProjectKind::Python);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn parse_tsc_errors() {
        let output = "src/a.ts(3,1): error TS2304: Cannot find name 'foo'.";
        let errors = parse_typecheck_errors(output, ProjectKind::Typescript);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn parse_rust_test_failures() {
        let output = "test parser::tests::roundtrip ... FAILED\ntest parser::tests::empty ... ok";
        let failures = parse_test_failures(output, ProjectKind::Rust);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("roundtrip"));
    }

    #[test]
    fn error_caps_are_enforced() {
        let output = (0..80)
            .map(|i| format!("f.py:{i}:1: E100 bad"))
            .collect::<Vec<_>>()
            .join("\n");
        let errors = parse_lint_errors(&output, ProjectKind::Python);
        assert_eq!(errors.len(), MAX_PARSED_ERRORS);
    }

    #[test]
    fn security_only_fails_on_high_severity() {
        let output = "Issue: X Severity: Low\nIssue: Y Severity: High\nIssue: Z Severity: Medium";
        let (errors, warnings) = parse_security_findings(output, ProjectKind::Python);
        assert_eq!(errors.len(), 1);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn gate_result_serializes_for_storage() {
        let result = GateResult::skipped(QualityGateType::Lint, "nothing to do");
        let value = result.to_value();
        assert_eq!(value.get("gate_type").and_then(Value::as_str), Some("lint"));
        assert_eq!(value.get("passed").and_then(Value::as_bool), Some(true));
        assert!(value.get("timestamp").is_some());
    }
}
