// Workflows loaded from disk and run through real shell processes
#![cfg(unix)]

use conveyor_engine::{
    progress_channel, EngineError, ExecutionEvent, ExecutorConfig, JobStatus, JsonFileStateStore,
    PromotionConfig, PromotionEngine, RunMetadata, ShellStepExecutor, StateStore,
    WorkflowExecutor, WorkflowParser,
};

use std::sync::Arc;
use std::time::Duration;

const RELEASE: &str = r#"
name: release
env:
  APP: conveyor
jobs:
  build:
    outputs:
      version: ${{ steps.version.outputs.value }}
    steps:
      - id: version
        run: echo "::set-output name=value::1.4.0"
      - run: echo "$APP $GREETING" > built.txt
        env:
          GREETING: hello
  test:
    needs: build
    strategy:
      matrix:
        suite: [unit, e2e]
    steps:
      - run: echo "${{ matrix.suite }}" >> suites.txt
  deploy:
    needs: [build, test]
    environment:
      name: staging
      version: ${{ needs.build.outputs.version }}
    steps:
      - run: test -f built.txt
environments:
  staging:
    deploy: echo "$DEPLOY_VERSION" > deployed.txt
    health-check: test -f deployed.txt
"#;

#[tokio::test]
async fn test_release_workflow_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir(&work).unwrap();
    let path = dir.path().join("release.yml");
    std::fs::write(&path, RELEASE).unwrap();

    let workflow = WorkflowParser::from_file(&path).unwrap();
    let store = Arc::new(JsonFileStateStore::new(dir.path().join("state")));
    let (tx, mut rx) = progress_channel();
    let promotion = PromotionEngine::for_workflow(&workflow, store.clone(), &work)
        .with_config(PromotionConfig::default().with_health_check_interval(Duration::from_millis(10)))
        .with_progress(tx.clone());

    let executor = WorkflowExecutor::new(workflow, Arc::new(ShellStepExecutor::new()))
        .unwrap()
        .with_config(ExecutorConfig::default().with_working_dir(&work))
        .with_progress(tx)
        .with_promotion(Arc::new(promotion));

    let report = executor.execute(RunMetadata::new("push")).await;
    drop(executor);

    assert!(report.success, "{:#?}", report.jobs);
    assert_eq!(report.count(JobStatus::Success), 4);
    assert_eq!(
        std::fs::read_to_string(work.join("built.txt")).unwrap().trim(),
        "conveyor hello"
    );
    let mut suites: Vec<String> = std::fs::read_to_string(work.join("suites.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    suites.sort();
    assert_eq!(suites, vec!["e2e", "unit"]);
    assert_eq!(
        std::fs::read_to_string(work.join("deployed.txt")).unwrap().trim(),
        "1.4.0"
    );

    let state = store.get("staging").await.unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some("1.4.0"));

    let mut saw_output = false;
    let mut saw_promotion = false;
    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::StepOutput { output, .. } if output.contains("set-output") => {
                saw_output = true
            }
            ExecutionEvent::PromotionCompleted { version, .. } => {
                saw_promotion = version == "1.4.0"
            }
            _ => {}
        }
    }
    assert!(saw_output);
    assert!(saw_promotion);
}

#[tokio::test]
async fn test_failing_shell_step_reports_exit_code() {
    let yaml = r#"
jobs:
  build:
    steps:
      - id: broken
        run: echo "bad input" >&2; exit 3
      - run: echo unreachable
"#;
    let workflow = WorkflowParser::parse_and_validate(yaml).unwrap();
    let executor = WorkflowExecutor::new(workflow, Arc::new(ShellStepExecutor::new())).unwrap();
    let report = executor.execute(RunMetadata::default()).await;

    let build = report.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failure);
    let broken = build.step("broken").unwrap();
    assert_eq!(broken.exit_code, Some(3));
    assert!(broken.stderr.contains("bad input"));
    assert_eq!(build.steps[1].attempts, 0);
}

#[test]
fn test_invalid_workflow_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cyclic.yml");
    std::fs::write(
        &path,
        "jobs:\n  a:\n    needs: b\n    steps: [{run: x}]\n  b:\n    needs: a\n    steps: [{run: y}]\n",
    )
    .unwrap();

    let err = WorkflowParser::from_file(&path).unwrap_err();
    assert!(matches!(err, EngineError::Graph(_)));
    assert!(err.to_string().contains("circular dependency"));
}
