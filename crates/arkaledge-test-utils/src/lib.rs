//! Shared scaffolding for integration tests: scratch git repositories and
//! project directories.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Create a temporary git repository with a configured identity and an
/// initial commit on `main`. Returns the TempDir (must be held alive) and
/// the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    run_git(&repo_path, &["init", "-b", "main"]);
    run_git(&repo_path, &["config", "user.email", "test@arkaledge.dev"]);
    run_git(&repo_path, &["config", "user.name", "Arkaledge Test"]);

    std::fs::write(repo_path.join("README.md"), "# Test project\n").expect("write README");
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Create a temporary project directory that is not yet a git repository,
/// seeded with a minimal Node-ish layout so context detection has
/// something to chew on.
pub fn create_temp_project() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().to_path_buf();
    std::fs::write(
        path.join("package.json"),
        r#"{"name":"demo","scripts":{"test":"vitest run"}}"#,
    )
    .expect("write package.json");
    std::fs::create_dir_all(path.join("src")).expect("create src");
    std::fs::write(path.join("src/index.ts"), "export const x = 1;\n").expect("write index.ts");
    (dir, path)
}

/// Run a git command in `dir`, panicking on failure.
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Capture git stdout in `dir`, panicking on failure.
pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}
