use bcce::artifact::{ArtifactStore, RunStatus, StepStatus};
use bcce::audit::AuditEventKind;
use bcce::engine::{CoordinatorOptions, RunCoordinator};
use bcce::governance::GovernanceConfig;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

/// A mock model CLI that proposes a diff inside a fenced block, the way
/// the agent transcript scanner expects to find it.
fn write_diff_script(path: &Path, diff_target: &str) {
    let body = format!(
        "#!/bin/sh
cat <<'EOF'
Proposed change:

```diff
--- a/{diff_target}
+++ b/{diff_target}
@@ -1,2 +1,2 @@
 first line
-second line
+patched line
```
EOF
"
    );
    write_script(path, &body);
}

fn write_workflow(dir: &Path, approve: bool) -> PathBuf {
    let body = format!(
        "version: 1
name: patcher
model_ref: claude
steps:
  - id: propose
    type: agent
    policy:
      timeout_seconds: 30
      max_files: 10
      max_edits: 5
      allowed_paths: [\"src/**\"]
      cmd_allowlist: []
  - id: apply
    type: apply-diff
    approve: {approve}
"
    );
    let path = dir.join("workflow.yaml");
    fs::write(&path, body).expect("write workflow");
    path
}

fn seed_target(dir: &Path) -> PathBuf {
    let target = dir.join("src/app.txt");
    fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
    fs::write(&target, "first line\nsecond line\n").expect("seed target");
    target
}

fn coordinator_with(
    artifacts_root: &Path,
    model_cli: &str,
    governance: GovernanceConfig,
) -> RunCoordinator {
    let options = CoordinatorOptions {
        artifacts_root: artifacts_root.to_path_buf(),
        model_cli: model_cli.to_string(),
        max_run_seconds: None,
        dry_run: false,
    };
    RunCoordinator::new(options, governance)
}

#[test]
fn diffs_from_prior_transcripts_are_applied_atomically() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    write_diff_script(&bin, "src/app.txt");
    let target = seed_target(temp.path());
    let path = write_workflow(temp.path(), false);

    let result = coordinator_with(
        &artifacts_root,
        &bin.display().to_string(),
        GovernanceConfig::default(),
    )
    .run_workflow(&path)
    .expect("run");
    assert_eq!(result.status, RunStatus::Completed);

    assert_eq!(
        fs::read_to_string(&target).expect("target"),
        "first line\npatched line\n"
    );

    let store = ArtifactStore::open(&artifacts_root, &result.run_id).expect("open");
    let step_dir = store.step_dir("apply");
    assert!(step_dir.join("diff.patch").is_file());
    assert!(step_dir.join("backup").is_dir());
    let output = fs::read_to_string(step_dir.join("output.txt")).expect("output");
    assert!(output.contains("src/app.txt"));
}

#[test]
fn paths_outside_the_allowed_set_are_rejected_before_any_write() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    // The proposed diff touches a path far outside allowed_paths.
    write_diff_script(&bin, "etc/hosts");
    seed_target(temp.path());
    let path = write_workflow(temp.path(), false);

    let result = coordinator_with(
        &artifacts_root,
        &bin.display().to_string(),
        GovernanceConfig::default(),
    )
    .run_workflow(&path)
    .expect("run");
    assert_eq!(result.status, RunStatus::Failed);

    let store = ArtifactStore::open(&artifacts_root, &result.run_id).expect("open");
    let state = store.load_run_state().expect("state");
    assert_eq!(state.step_results[1].status, StepStatus::Failed);

    let error = fs::read_to_string(store.step_dir("apply").join("error.txt")).expect("error");
    assert!(error.contains("path_not_allowed"));
    assert!(!temp.path().join("etc/hosts").exists());

    assert!(result.audit_trail.iter().any(|r| {
        r.event == AuditEventKind::PolicyViolation
            && r.details.get("severity").and_then(|v| v.as_str()) == Some("high")
    }));
}

#[test]
fn parent_traversal_in_a_diff_is_a_path_escape() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    write_diff_script(&bin, "../outside.txt");
    seed_target(temp.path());
    let path = write_workflow(temp.path(), false);

    let result = coordinator_with(
        &artifacts_root,
        &bin.display().to_string(),
        GovernanceConfig::default(),
    )
    .run_workflow(&path)
    .expect("run");
    assert_eq!(result.status, RunStatus::Failed);

    let store = ArtifactStore::open(&artifacts_root, &result.run_id).expect("open");
    let error = fs::read_to_string(store.step_dir("apply").join("error.txt")).expect("error");
    assert!(error.contains("path_escape"));
}

#[test]
fn conflicting_diffs_for_the_same_file_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    let body = "#!/bin/sh
cat <<'EOF'
```diff
--- a/src/app.txt
+++ b/src/app.txt
@@ -1,2 +1,2 @@
 first line
-second line
+patched line
```

```diff
--- a/src/app.txt
+++ b/src/app.txt
@@ -1,2 +1,2 @@
-first line
+another line
 second line
```
EOF
";
    write_script(&bin, body);
    let target = seed_target(temp.path());
    let path = write_workflow(temp.path(), false);

    let result = coordinator_with(
        &artifacts_root,
        &bin.display().to_string(),
        GovernanceConfig::default(),
    )
    .run_workflow(&path)
    .expect("run");
    assert_eq!(result.status, RunStatus::Failed);

    let store = ArtifactStore::open(&artifacts_root, &result.run_id).expect("open");
    let error = fs::read_to_string(store.step_dir("apply").join("error.txt")).expect("error");
    assert!(error.contains("diff_conflict"));
    // Nothing was modified.
    assert_eq!(
        fs::read_to_string(&target).expect("target"),
        "first line\nsecond line\n"
    );
}

#[test]
fn missing_diffs_fail_the_apply_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    write_script(&bin, "#!/bin/sh\necho 'no changes needed'\n");
    seed_target(temp.path());
    let path = write_workflow(temp.path(), false);

    let result = coordinator_with(
        &artifacts_root,
        &bin.display().to_string(),
        GovernanceConfig::default(),
    )
    .run_workflow(&path)
    .expect("run");
    assert_eq!(result.status, RunStatus::Failed);

    let store = ArtifactStore::open(&artifacts_root, &result.run_id).expect("open");
    let error = fs::read_to_string(store.step_dir("apply").join("error.txt")).expect("error");
    assert!(error.contains("no_diffs_found"));
}

#[test]
fn approval_gate_holds_the_run_until_a_decision_is_made() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    write_diff_script(&bin, "src/app.txt");
    let target = seed_target(temp.path());
    let path = write_workflow(temp.path(), true);

    let governance: GovernanceConfig =
        serde_yaml::from_str("approval_required: true\n").expect("governance");
    let engine = coordinator_with(&artifacts_root, &bin.display().to_string(), governance);

    let held = engine.run_workflow(&path).expect("run");
    assert_eq!(held.status, RunStatus::PendingApproval);
    assert!(held
        .audit_trail
        .iter()
        .any(|r| r.event == AuditEventKind::ApprovalRequest));
    // Nothing has executed and no diff has been applied.
    assert_eq!(
        fs::read_to_string(&target).expect("target"),
        "first line\nsecond line\n"
    );

    let approved = engine
        .resolve_approval(&held.run_id, true, Some("release-manager"))
        .expect("approve");
    assert_eq!(approved.status, RunStatus::Completed);
    assert_eq!(
        fs::read_to_string(&target).expect("target"),
        "first line\npatched line\n"
    );
    assert!(approved.audit_trail.iter().any(|r| {
        r.event == AuditEventKind::ApprovalDecision
            && r.actor.as_deref() == Some("release-manager")
    }));
}

#[test]
fn rejected_approval_blocks_the_run_and_applies_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts_root = temp.path().join("runs");
    let bin = temp.path().join("model-cli");
    write_diff_script(&bin, "src/app.txt");
    let target = seed_target(temp.path());
    let path = write_workflow(temp.path(), true);

    let governance: GovernanceConfig =
        serde_yaml::from_str("approval_required: true\n").expect("governance");
    let engine = coordinator_with(&artifacts_root, &bin.display().to_string(), governance);

    let held = engine.run_workflow(&path).expect("run");
    assert_eq!(held.status, RunStatus::PendingApproval);

    let rejected = engine
        .resolve_approval(&held.run_id, false, Some("release-manager"))
        .expect("reject");
    assert_eq!(rejected.status, RunStatus::Blocked);
    assert_eq!(
        fs::read_to_string(&target).expect("target"),
        "first line\nsecond line\n"
    );

    let store = ArtifactStore::open(&artifacts_root, &rejected.run_id).expect("open");
    let state = store.load_run_state().expect("state");
    assert!(state
        .step_results
        .iter()
        .all(|r| r.status == StepStatus::Pending));
}
