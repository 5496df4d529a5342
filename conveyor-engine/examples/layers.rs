use conveyor_engine::{
    ExecutorConfig, JobStatus, RunMetadata, ShellStepExecutor, WorkflowExecutor, WorkflowParser,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let yaml = r#"
name: test-layers
jobs:
  build:
    steps:
      - name: Build step
        run: echo "Building..."
  test:
    needs: build
    strategy:
      matrix:
        suite: [unit, integration]
    steps:
      - name: Test
        run: echo "Testing ${{ matrix.suite }}..."
  report:
    needs: test
    run-always: true
    steps:
      - run: echo "Tests finished with ${{ needs.test.result }}"
"#;

    let workflow = WorkflowParser::parse_and_validate(yaml).expect("Failed to parse");
    println!("Parsed workflow: {}", workflow.display_name());
    println!("Number of jobs: {}", workflow.jobs.len());

    let executor = WorkflowExecutor::new(workflow, Arc::new(ShellStepExecutor::new()))
        .expect("Failed to build execution graph")
        .with_config(
            ExecutorConfig::default()
                .with_working_dir(std::env::current_dir().expect("no current directory")),
        );

    for (i, layer) in executor.graph().layers().iter().enumerate() {
        println!("  Layer {}: {}", i + 1, layer.join(", "));
    }

    println!("\nExecuting workflow...\n");
    let report = executor.execute(RunMetadata::new("manual")).await;

    println!("Execution completed in {:.2}s", report.duration.as_secs_f64());
    for job in &report.jobs {
        let icon = match job.status {
            JobStatus::Success => "ok",
            JobStatus::Skipped => "skip",
            _ => "FAIL",
        };
        println!("  [{}] {}", icon, job.instance_id);
        for step in &job.steps {
            if !step.stdout.is_empty() {
                println!("        {}", step.stdout);
            }
        }
    }
}
