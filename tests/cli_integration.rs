//! Integration tests for the reqgraph CLI
//!
//! Each test runs the real binary against a database inside a temp dir.

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// Run reqgraph with its database and working directory inside `dir`
fn run_reqgraph(args: &[&str], dir: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_reqgraph"))
        .args(args)
        .current_dir(dir)
        .env("REQGRAPH_DB_PATH", dir.join("test.db"))
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute reqgraph")
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// alice owns project 1 with group 1
fn seed(dir: &Path) {
    let steps: [&[&str]; 3] = [
        &["user", "add", "alice", "--password", "password1"],
        &["project", "add", "Apollo", "--as", "alice"],
        &["group", "add", "1", "Core", "--as", "alice"],
    ];
    for args in steps {
        let output = run_reqgraph(args, dir);
        assert!(output.status.success(), "{:?} failed: {}", args, stderr(&output));
    }
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_reqgraph"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("reqgraph"));
    assert!(out.contains("Requirements management"));
    assert!(out.contains("import"));
    assert!(out.contains("export"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_reqgraph"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("reqgraph"));
}

#[test]
fn test_completion_bash() {
    let tmp = TempDir::new().unwrap();
    let output = run_reqgraph(&["completion", "bash"], tmp.path());

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("_reqgraph"));
    assert!(out.contains("complete"));
}

#[test]
fn test_completion_zsh() {
    let tmp = TempDir::new().unwrap();
    let output = run_reqgraph(&["completion", "zsh"], tmp.path());

    assert!(output.status.success());
    assert!(stdout(&output).contains("#compdef reqgraph"));
}

// =============================================================================
// Accounts and Projects
// =============================================================================

#[test]
fn test_user_add() {
    let tmp = TempDir::new().unwrap();
    let output = run_reqgraph(&["user", "add", "alice", "--password", "password1"], tmp.path());

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("alice"));
    assert!(tmp.path().join("test.db").exists());
}

#[test]
fn test_user_add_rejects_short_password() {
    let tmp = TempDir::new().unwrap();
    let output = run_reqgraph(&["user", "add", "alice", "--password", "abc"], tmp.path());

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Error"));
}

#[test]
fn test_duplicate_user_fails() {
    let tmp = TempDir::new().unwrap();
    run_reqgraph(&["user", "add", "alice", "--password", "password1"], tmp.path());
    let output = run_reqgraph(&["user", "add", "alice", "--password", "password2"], tmp.path());

    assert!(!output.status.success());
}

#[test]
fn test_project_list_is_scoped_to_members() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());
    run_reqgraph(&["user", "add", "bob", "--password", "password2"], tmp.path());

    let alice = run_reqgraph(&["project", "list", "--as", "alice"], tmp.path());
    assert!(alice.status.success());
    assert!(stdout(&alice).contains("Apollo"));

    let bob = run_reqgraph(&["project", "list", "--as", "bob"], tmp.path());
    assert!(bob.status.success());
    assert!(!stdout(&bob).contains("Apollo"));

    let added = run_reqgraph(&["project", "member", "1", "bob", "--as", "alice"], tmp.path());
    assert!(added.status.success(), "stderr: {}", stderr(&added));

    let bob = run_reqgraph(&["project", "list", "--as", "bob"], tmp.path());
    assert!(stdout(&bob).contains("Apollo"));
}

#[test]
fn test_non_member_cannot_add_group() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());
    run_reqgraph(&["user", "add", "mallory", "--password", "password3"], tmp.path());

    let output = run_reqgraph(&["group", "add", "1", "Intruders", "--as", "mallory"], tmp.path());
    assert!(!output.status.success());
}

#[test]
fn test_unknown_actor_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run_reqgraph(&["project", "add", "Apollo", "--as", "ghost"], tmp.path());

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Error"));
}

// =============================================================================
// Import / Export
// =============================================================================

#[test]
fn test_import_then_export_csv() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());

    let sheet = tmp.path().join("reqs.csv");
    std::fs::write(
        &sheet,
        "Requirement ID,Title,Description,Status,Chapter,Parent ID\n\
         SYS-1,Reach orbit,,Approved,1,\n\
         PRP-1,Provide thrust,30 kN,Draft,2,SYS-1\n",
    )
    .unwrap();

    let output = run_reqgraph(
        &["import", sheet.to_str().unwrap(), "--project", "1", "--group", "1", "--as", "alice"],
        tmp.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("2 created"));
    assert!(out.contains("1 links"));

    // The staged copy is cleaned up after import
    let uploads = tmp.path().join(".reqgraph").join("uploads");
    if uploads.exists() {
        assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
    }

    let output = run_reqgraph(&["export", "--as", "alice", "--format", "csv"], tmp.path());
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("SYS-1"));
    assert!(out.contains("PRP-1"));
    assert!(out.contains("Reach orbit"));
}

#[test]
fn test_import_missing_columns_fails() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());

    let sheet = tmp.path().join("bad.csv");
    std::fs::write(&sheet, "Name,Notes\nfoo,bar\n").unwrap();

    let output = run_reqgraph(
        &["import", sheet.to_str().unwrap(), "--project", "1", "--group", "1", "--as", "alice"],
        tmp.path(),
    );
    assert!(!output.status.success());
}

#[test]
fn test_export_dot() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());

    let sheet = tmp.path().join("reqs.csv");
    std::fs::write(
        &sheet,
        "Requirement ID,Title,Parent ID\nSYS-1,Reach orbit,\nPRP-1,Provide thrust,SYS-1\n",
    )
    .unwrap();
    let output = run_reqgraph(
        &["import", sheet.to_str().unwrap(), "--project", "1", "--group", "1", "--as", "alice"],
        tmp.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = run_reqgraph(&["export", "--as", "alice", "--format", "dot", "--roots", "SYS-1"], tmp.path());
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("digraph"));
    assert!(out.contains("->"));
}

#[test]
fn test_export_xlsx_needs_output() {
    let tmp = TempDir::new().unwrap();
    seed(tmp.path());

    let output = run_reqgraph(&["export", "--as", "alice", "--format", "xlsx"], tmp.path());
    assert!(!output.status.success());

    let target = tmp.path().join("out.xlsx");
    let output = run_reqgraph(
        &["export", "--as", "alice", "--format", "xlsx", "-o", target.to_str().unwrap()],
        tmp.path(),
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let bytes = std::fs::read(&target).unwrap();
    // xlsx is a zip archive
    assert_eq!(&bytes[..2], b"PK");
}
