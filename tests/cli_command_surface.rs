use bcce::app::run_cli;
use std::fs;
use std::path::Path;

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn write_valid_workflow(dir: &Path) -> String {
    let path = dir.join("workflow.yaml");
    fs::write(
        &path,
        "version: 1
name: cli-demo
model_ref: claude
command_allowlist: [echo]
steps:
  - id: hello
    type: cmd
    command: echo hi
",
    )
    .expect("write workflow");
    path.display().to_string()
}

#[test]
fn validate_exits_zero_for_a_valid_workflow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_valid_workflow(temp.path());
    assert_eq!(run_cli(args(&["workflow", "validate", &path])), 0);
}

#[test]
fn validate_exits_one_for_an_invalid_workflow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("workflow.yaml");
    fs::write(
        &path,
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
    )
    .expect("write workflow");
    assert_eq!(
        run_cli(args(&["workflow", "validate", &path.display().to_string()])),
        1
    );
}

#[test]
fn validate_exits_one_for_a_missing_file() {
    assert_eq!(
        run_cli(args(&["workflow", "validate", "/nonexistent/workflow.yaml"])),
        1
    );
}

#[test]
fn missing_arguments_exit_with_config_code() {
    assert_eq!(run_cli(args(&["workflow", "run"])), 2);
    assert_eq!(run_cli(args(&["workflow", "resume"])), 2);
    assert_eq!(run_cli(args(&["workflow"])), 2);
    assert_eq!(run_cli(args(&["workflow", "approve", "run-1"])), 2);
}

#[test]
fn run_and_status_and_doctor_share_the_artifacts_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runs_root = temp.path().join("runs");
    std::env::set_var("BCCE_ARTIFACTS_ROOT", &runs_root);

    let alpha_path = write_valid_workflow(temp.path());
    assert_eq!(run_cli(args(&["workflow", "run", &alpha_path])), 0);

    let alpha_run = bcce::artifact::list_run_ids(&runs_root)
        .expect("list runs")
        .into_iter()
        .next()
        .expect("one run");
    assert_eq!(run_cli(args(&["workflow", "status", &alpha_run])), 0);

    // Doctor warns about the missing model CLI but does not fail.
    assert_eq!(run_cli(args(&["doctor"])), 0);

    // A second, unrelated workflow under the same artifacts root.
    let beta_dir = temp.path().join("beta");
    fs::create_dir_all(&beta_dir).expect("mkdir beta");
    let beta_file = beta_dir.join("workflow.yaml");
    fs::write(
        &beta_file,
        "version: 1
name: cli-demo-beta
model_ref: claude
command_allowlist: [echo]
steps:
  - id: hello
    type: cmd
    command: echo beta
",
    )
    .expect("write beta workflow");
    let beta_path = beta_file.display().to_string();
    assert_eq!(run_cli(args(&["workflow", "run", &beta_path])), 0);
    let beta_run = bcce::artifact::list_run_ids(&runs_root)
        .expect("list runs")
        .into_iter()
        .find(|id| id != &alpha_run)
        .expect("beta run");

    // `run <path> --resume-from` resumes the run belonging to <path>'s
    // workflow, never whichever run happens to be newest.
    let audit_lines = |run_id: &str| {
        fs::read_to_string(runs_root.join(run_id).join("audit.log"))
            .expect("audit log")
            .lines()
            .count()
    };
    let alpha_before = audit_lines(&alpha_run);
    let beta_before = audit_lines(&beta_run);
    assert_eq!(
        run_cli(args(&["workflow", "run", &alpha_path, "--resume-from", "hello"])),
        0
    );
    assert!(audit_lines(&alpha_run) > alpha_before);
    assert_eq!(audit_lines(&beta_run), beta_before);

    // A workflow that never ran cannot be resumed through `run`.
    let gamma_dir = temp.path().join("gamma");
    fs::create_dir_all(&gamma_dir).expect("mkdir gamma");
    let gamma_file = gamma_dir.join("workflow.yaml");
    fs::write(
        &gamma_file,
        "version: 1
name: cli-demo-gamma
model_ref: claude
command_allowlist: [echo]
steps:
  - id: hello
    type: cmd
    command: echo gamma
",
    )
    .expect("write gamma workflow");
    let gamma_path = gamma_file.display().to_string();
    assert_eq!(
        run_cli(args(&["workflow", "run", &gamma_path, "--resume-from", "hello"])),
        2
    );

    std::env::remove_var("BCCE_ARTIFACTS_ROOT");
}
