use bcce::workflow::{parse_workflow_file, validate_workflow, WorkflowError};
use std::fs;
use std::path::Path;

fn write_workflow(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("workflow.yaml");
    fs::write(&path, body).expect("write workflow");
    path
}

#[test]
fn valid_workflow_parses_and_validates() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("task.md"), "Do the thing.\n").expect("prompt file");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: release-check
model_ref: claude-sonnet
guardrails: [pii-filter]
command_allowlist: [echo]
env:
  max_runtime_seconds: 600
  REGION: us-east-1
steps:
  - id: gather
    type: prompt
    prompt_file: task.md
  - id: build
    type: cmd
    command: echo building
  - id: review
    type: agent
    policy:
      timeout_seconds: 120
      max_files: 20
      max_edits: 10
      allowed_paths: [\"src/**\"]
      cmd_allowlist: [cargo]
  - id: apply
    type: apply-diff
    approve: true
",
    );

    let loaded = parse_workflow_file(&path).expect("parse");
    assert_eq!(loaded.definition.steps.len(), 4);
    let result = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert!(result.valid, "errors: {:?}", result.errors);
    assert!(result.warnings.is_empty());
}

#[test]
fn duplicate_step_ids_fail_validation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: dup
model_ref: claude
steps:
  - id: analyze
    type: cmd
    command: echo one
  - id: analyze
    type: cmd
    command: echo two
",
    );
    let loaded = parse_workflow_file(&path).expect("parse");
    let result = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert!(!result.valid);
    assert!(result
        .errors
        .contains(&"Duplicate step ID: analyze".to_string()));
}

#[test]
fn missing_prompt_file_fails_validation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: missing-prompt
model_ref: claude
steps:
  - id: gather
    type: prompt
    prompt_file: nowhere.md
",
    );
    let loaded = parse_workflow_file(&path).expect("parse");
    let result = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert!(!result.valid);
    assert!(result.errors.iter().any(|e| e.contains("nowhere.md")));
}

#[test]
fn unknown_step_type_is_a_parse_error_not_a_runtime_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: bad-type
model_ref: claude
steps:
  - id: x
    type: teleport
",
    );
    let err = parse_workflow_file(&path).expect_err("must fail");
    assert!(matches!(err, WorkflowError::Parse { .. }));
    assert!(err.to_string().contains("teleport"));
}

#[test]
fn empty_steps_fail_validation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1\nname: empty\nmodel_ref: claude\nsteps: []\n",
    );
    let loaded = parse_workflow_file(&path).expect("parse");
    let result = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert!(!result.valid);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("at least one step")));
}

#[test]
fn unset_model_ref_template_is_a_warning_not_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: templated
model_ref: \"${BCCE_TEST_UNSET_MODEL_VAR_XYZ}\"
command_allowlist: [echo]
steps:
  - id: hello
    type: cmd
    command: echo hi
",
    );
    let loaded = parse_workflow_file(&path).expect("parse");
    let result = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert!(result.valid);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("BCCE_TEST_UNSET_MODEL_VAR_XYZ")));
}

#[test]
fn validation_of_a_validated_workflow_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(
        temp.path(),
        "version: 1
name: idem
model_ref: claude
command_allowlist: [echo]
steps:
  - id: hello
    type: cmd
    command: echo hi
",
    );
    let loaded = parse_workflow_file(&path).expect("parse");
    let first = validate_workflow(&loaded.definition, &loaded.base_dir);
    let second = validate_workflow(&loaded.definition, &loaded.base_dir);
    assert_eq!(first, second);
}
