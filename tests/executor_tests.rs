use cronfleet::model::Job;
use cronfleet::worker::Executor;

fn shell_job(id: &str, command: &str) -> Job {
    Job {
        id: id.to_string(),
        name: format!("job-{id}"),
        group: "sys".to_string(),
        command: command.to_string(),
        user: None,
        rules: Vec::new(),
        pause: false,
        run_on: Some("10.0.0.1".to_string()),
    }
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = Executor::default();
    let report = executor.execute(&shell_job("J", "echo hello")).await;

    assert!(report.success);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.output, Some("hello\n".to_string()));
    assert!(report.error.is_none());
}

#[tokio::test]
async fn test_execute_empty_output_is_none() {
    let executor = Executor::default();
    let report = executor.execute(&shell_job("J", "true")).await;

    assert!(report.success);
    assert!(report.output.is_none());
    assert!(report.error.is_none());
}

#[tokio::test]
async fn test_execute_nonzero_exit() {
    let executor = Executor::default();
    let report = executor.execute(&shell_job("J", "exit 3")).await;

    assert!(!report.success);
    assert_eq!(report.exit_code, Some(3));
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_execute_captures_stderr() {
    let executor = Executor::default();
    let report = executor
        .execute(&shell_job("J", "echo 'boom' >&2; exit 1"))
        .await;

    assert!(!report.success);
    assert!(report.error.expect("stderr captured").contains("boom"));
}

#[tokio::test]
async fn test_execute_missing_binary() {
    let executor = Executor::default();
    let report = executor
        .execute(&shell_job("J", "cronfleet_no_such_binary_xyz"))
        .await;

    assert!(!report.success);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_execute_pipeline() {
    let executor = Executor::default();
    let report = executor
        .execute(&shell_job("J", "printf 'a b c' | wc -w"))
        .await;

    assert!(report.success);
    assert_eq!(report.output.expect("word count").trim(), "3");
}

#[tokio::test]
async fn test_invocations_are_unique() {
    let executor = Executor::default();
    let first = executor.execute(&shell_job("J", "true")).await;
    let second = executor.execute(&shell_job("J", "true")).await;
    assert_ne!(first.invocation, second.invocation);
}
