//! Shared project context: a fingerprinted digest of the project directory
//! plus the prompt preamble every role shares.
//!
//! The context is persisted per project at
//! `.arkaledge/project-context.{json,md}` and only rebuilt when the
//! fingerprint changes, so repeated runs on an unchanged tree skip the
//! directory scan.

use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use arkaledge_store::STATE_DIR;

/// Persisted context file names inside [`STATE_DIR`].
pub const CONTEXT_JSON: &str = "project-context.json";
pub const CONTEXT_MD: &str = "project-context.md";

/// Files whose size and mtime feed the fingerprint.
const SIGNAL_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "tsconfig.json",
    "README.md",
    "AGENTS.md",
    "CLOUD.md",
];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    ".git",
    STATE_DIR,
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
];

/// Bounds on the recursive scan.
const MAX_INVENTORY: usize = 400;
const MAX_DEPTH: usize = 4;
const MAX_IMPORTANT_FILES: usize = 20;
const MAX_SAMPLE_FILES: usize = 15;

/// Doc excerpts are capped at this many characters.
const EXCERPT_CAP: usize = 2500;

/// Snapshot of the project's shape shared by every role prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    /// Stable hash of the canonical directory digest.
    pub fingerprint: String,
    pub generated_at: DateTime<Utc>,
    pub primary_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    pub source_file_count: usize,
    pub test_file_count: usize,
    pub important_files: Vec<String>,
    pub sample_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents_md_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_md_excerpt: Option<String>,
}

impl ProjectContext {
    /// Load the persisted context if its fingerprint still matches the
    /// directory, otherwise rebuild and persist it.
    pub fn load_or_build(project_dir: &Path) -> Result<Self> {
        let fingerprint = compute_fingerprint(project_dir)?;
        let json_path = project_dir.join(STATE_DIR).join(CONTEXT_JSON);

        if let Ok(content) = std::fs::read_to_string(&json_path) {
            if let Ok(cached) = serde_json::from_str::<ProjectContext>(&content) {
                if cached.fingerprint == fingerprint {
                    tracing::debug!(fingerprint = %fingerprint, "reusing cached project context");
                    return Ok(cached);
                }
            }
        }

        let context = analyze(project_dir, fingerprint)?;
        context.persist(project_dir)?;
        tracing::info!(
            language = %context.primary_language,
            sources = context.source_file_count,
            "rebuilt project context"
        );
        Ok(context)
    }

    fn persist(&self, project_dir: &Path) -> Result<()> {
        let dir = project_dir.join(STATE_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let json_path = dir.join(CONTEXT_JSON);
        let json = serde_json::to_string_pretty(self).context("failed to serialize context")?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("failed to write {}", json_path.display()))?;

        let md_path = dir.join(CONTEXT_MD);
        std::fs::write(&md_path, self.preamble())
            .with_context(|| format!("failed to write {}", md_path.display()))?;
        Ok(())
    }

    /// The shared prompt preamble built from this context.
    pub fn preamble(&self) -> String {
        let mut out = String::from("## Project Context\n\n");
        out.push_str(&format!("- Primary language: {}\n", self.primary_language));
        if let Some(pm) = &self.package_manager {
            out.push_str(&format!("- Package manager: {pm}\n"));
        }
        if let Some(cmd) = &self.test_command {
            out.push_str(&format!("- Test command: `{cmd}`\n"));
        }
        out.push_str(&format!(
            "- Source files: {} ({} test files)\n",
            self.source_file_count, self.test_file_count
        ));

        if !self.important_files.is_empty() {
            out.push_str("\n### Important files\n");
            for file in &self.important_files {
                out.push_str(&format!("- {file}\n"));
            }
        }
        if !self.sample_files.is_empty() {
            out.push_str("\n### Sample files\n");
            for file in &self.sample_files {
                out.push_str(&format!("- {file}\n"));
            }
        }
        if let Some(excerpt) = &self.agents_md_excerpt {
            out.push_str("\n### AGENTS.md\n");
            out.push_str(excerpt);
            out.push('\n');
        }
        if let Some(excerpt) = &self.cloud_md_excerpt {
            out.push_str("\n### CLOUD.md\n");
            out.push_str(excerpt);
            out.push('\n');
        }
        out
    }
}

/// Stable hash of a canonical digest of the project directory.
pub fn compute_fingerprint(project_dir: &Path) -> Result<String> {
    let mut digest = String::new();

    // Sorted root entries.
    let mut roots: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(project_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !SKIP_DIRS.contains(&name.as_str()) {
                roots.push(name);
            }
        }
    }
    roots.sort();
    for name in &roots {
        digest.push_str(&format!("root:{name}\n"));
    }

    // Signal file sizes and mtimes.
    for name in SIGNAL_FILES {
        let path = project_dir.join(name);
        if let Ok(meta) = std::fs::metadata(&path) {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            digest.push_str(&format!("signal:{name}:{}:{mtime}\n", meta.len()));
        }
    }

    // Bounded recursive inventory.
    for entry in walk_inventory(project_dir) {
        digest.push_str(&format!("file:{}:{}\n", entry.rel_path, entry.size));
    }

    let mut hasher = Sha256::new();
    hasher.update(digest.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

struct InventoryEntry {
    rel_path: String,
    size: u64,
}

/// Bounded, sorted, depth-limited recursive file listing.
fn walk_inventory(project_dir: &Path) -> Vec<InventoryEntry> {
    let mut out = Vec::new();
    walk_dir(project_dir, project_dir, 0, &mut out);
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    out.truncate(MAX_INVENTORY);
    out
}

fn walk_dir(root: &Path, dir: &Path, depth: usize, out: &mut Vec<InventoryEntry>) {
    if depth > MAX_DEPTH || out.len() >= MAX_INVENTORY {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if out.len() >= MAX_INVENTORY {
            return;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if !SKIP_DIRS.contains(&name.as_str()) && !name.starts_with('.') {
                walk_dir(root, &path, depth + 1, out);
            }
        } else if file_type.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let rel_path = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            out.push(InventoryEntry { rel_path, size });
        }
    }
}

/// Build a fresh context by scanning the directory.
fn analyze(project_dir: &Path, fingerprint: String) -> Result<ProjectContext> {
    let inventory = walk_inventory(project_dir);

    let mut ext_counts: std::collections::HashMap<&'static str, usize> =
        std::collections::HashMap::new();
    let mut source_file_count = 0usize;
    let mut test_file_count = 0usize;
    let mut sample_files = Vec::new();

    for entry in &inventory {
        let Some(language) = language_for(&entry.rel_path) else {
            continue;
        };
        source_file_count += 1;
        *ext_counts.entry(language).or_default() += 1;
        if is_test_file(&entry.rel_path) {
            test_file_count += 1;
        } else if sample_files.len() < MAX_SAMPLE_FILES {
            sample_files.push(entry.rel_path.clone());
        }
    }

    let primary_language = ext_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(language, _)| language.to_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let package_manager = detect_package_manager(project_dir);
    let test_command = detect_test_command(project_dir, package_manager.as_deref());

    let mut important_files: Vec<String> = SIGNAL_FILES
        .iter()
        .map(|s| s.to_string())
        .chain(
            ["src/main.rs", "src/lib.rs", "src/index.ts", "src/index.js", "main.py"]
                .iter()
                .map(|s| s.to_string()),
        )
        .filter(|f| project_dir.join(f).exists())
        .collect();
    important_files.truncate(MAX_IMPORTANT_FILES);

    Ok(ProjectContext {
        fingerprint,
        generated_at: Utc::now(),
        primary_language,
        package_manager,
        test_command,
        source_file_count,
        test_file_count,
        important_files,
        sample_files,
        agents_md_excerpt: read_excerpt(&project_dir.join("AGENTS.md")),
        cloud_md_excerpt: read_excerpt(&project_dir.join("CLOUD.md")),
    })
}

fn language_for(rel_path: &str) -> Option<&'static str> {
    let ext = Path::new(rel_path).extension()?.to_str()?;
    match ext {
        "ts" | "tsx" => Some("TypeScript"),
        "js" | "jsx" | "mjs" => Some("JavaScript"),
        "rs" => Some("Rust"),
        "py" => Some("Python"),
        "go" => Some("Go"),
        _ => None,
    }
}

fn is_test_file(rel_path: &str) -> bool {
    let lower = rel_path.to_ascii_lowercase();
    lower.contains(".test.")
        || lower.contains(".spec.")
        || lower.contains("_test.")
        || lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.contains("/test/")
}

fn detect_package_manager(project_dir: &Path) -> Option<String> {
    let checks: &[(&str, &str)] = &[
        ("pnpm-lock.yaml", "pnpm"),
        ("yarn.lock", "yarn"),
        ("package-lock.json", "npm"),
        ("package.json", "npm"),
        ("Cargo.toml", "cargo"),
        ("go.mod", "go"),
        ("pyproject.toml", "pip"),
        ("requirements.txt", "pip"),
    ];
    checks
        .iter()
        .find(|(file, _)| project_dir.join(file).exists())
        .map(|(_, pm)| pm.to_string())
}

fn detect_test_command(project_dir: &Path, package_manager: Option<&str>) -> Option<String> {
    match package_manager? {
        pm @ ("npm" | "yarn" | "pnpm") => {
            let package_json = std::fs::read_to_string(project_dir.join("package.json")).ok()?;
            let parsed: serde_json::Value = serde_json::from_str(&package_json).ok()?;
            parsed
                .get("scripts")
                .and_then(|s| s.get("test"))
                .map(|_| format!("{pm} test"))
        }
        "cargo" => Some("cargo test".to_owned()),
        "go" => Some("go test ./...".to_owned()),
        "pip" => Some("pytest".to_owned()),
        _ => None,
    }
}

fn read_excerpt(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut excerpt = content.trim().to_owned();
    if excerpt.is_empty() {
        return None;
    }
    if excerpt.len() > EXCERPT_CAP {
        let mut cut = EXCERPT_CAP;
        while !excerpt.is_char_boundary(cut) {
            cut -= 1;
        }
        excerpt.truncate(cut);
    }
    Some(excerpt)
}
