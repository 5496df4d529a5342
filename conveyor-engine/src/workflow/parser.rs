// Workflow Loader
// Reads workflow YAML and rejects invalid workflows before anything runs

use crate::error::{EngineError, EngineResult};
use crate::execution::graph::ExecutionGraph;
use crate::execution::matrix::{expand_jobs, MatrixExpander};
use crate::expression::{parse_condition, parse_template};
use crate::value::Value;
use crate::workflow::models::{JobSpec, RetryPolicy, WorkflowSpec};

use std::collections::HashSet;
use std::path::Path;

/// Parser for workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse and validate a workflow file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<WorkflowSpec> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_and_validate(&content)
    }

    /// Parse a workflow from a YAML string without semantic checks.
    pub fn parse(content: &str) -> EngineResult<WorkflowSpec> {
        let mut workflow: WorkflowSpec = serde_yaml::from_str(content)?;
        for (id, job) in workflow.jobs.iter_mut() {
            job.id = id.clone();
        }
        Ok(workflow)
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_and_validate(content: &str) -> EngineResult<WorkflowSpec> {
        let workflow = Self::parse(content)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Validate a parsed workflow for semantic correctness.
    ///
    /// Checks run in a fixed order: job and step structure, expressions,
    /// then the dependency graph.
    pub fn validate(workflow: &WorkflowSpec) -> EngineResult<()> {
        for (key, value) in &workflow.env {
            check_template(&format!("env.{}", key), value)?;
        }

        for (job_id, job) in &workflow.jobs {
            Self::validate_job(workflow, job_id, job)?;
        }

        let instances = expand_jobs(workflow)?;
        ExecutionGraph::build(&instances)?;

        Ok(())
    }

    fn validate_job(workflow: &WorkflowSpec, job_id: &str, job: &JobSpec) -> EngineResult<()> {
        let at = |field: &str| format!("jobs.{}.{}", job_id, field);

        if let Some(condition) = &job.if_condition {
            parse_condition(condition).map_err(|e| EngineError::parse(at("if"), e))?;
        }
        for (key, value) in &job.env {
            check_template(&at(&format!("env.{}", key)), value)?;
        }
        for (key, value) in &job.outputs {
            check_template(&at(&format!("outputs.{}", key)), value)?;
        }
        if let Some(retry) = &job.retry {
            check_retry(&at("retry"), retry)?;
        }
        if let Some(matrix) = job.matrix() {
            MatrixExpander::validate(matrix)
                .map_err(|e| EngineError::config(format!("{}: {}", at("strategy.matrix"), e)))?;
        }
        if let Some(target) = &job.environment {
            if !workflow.environments.contains_key(target.name()) {
                return Err(EngineError::config(format!(
                    "job '{}' deploys to unknown environment '{}'",
                    job_id,
                    target.name()
                )));
            }
            check_template(&at("environment.version"), target.version_template())?;
        }

        let mut step_ids = HashSet::new();
        for (index, step) in job.steps.iter().enumerate() {
            let at = |field: &str| format!("jobs.{}.steps[{}].{}", job_id, index, field);

            match (&step.run, &step.uses) {
                (None, None) => {
                    return Err(EngineError::config(format!(
                        "step {} '{}' in job '{}' must have either 'run' or 'uses'",
                        index,
                        step.display_name(),
                        job_id
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(EngineError::config(format!(
                        "step {} '{}' in job '{}' cannot have both 'run' and 'uses'",
                        index,
                        step.display_name(),
                        job_id
                    )))
                }
                _ => {}
            }

            if let Some(id) = &step.id {
                if !step_ids.insert(id.as_str()) {
                    return Err(EngineError::config(format!(
                        "duplicate step id '{}' in job '{}'",
                        id, job_id
                    )));
                }
            }
            if let Some(retry) = &step.retry {
                check_retry(&at("retry"), retry)?;
            }
            if let Some(condition) = &step.if_condition {
                parse_condition(condition).map_err(|e| EngineError::parse(at("if"), e))?;
            }
            if let Some(run) = &step.run {
                check_template(&at("run"), run)?;
            }
            for (key, value) in &step.env {
                check_template(&at(&format!("env.{}", key)), value)?;
            }
            for (key, value) in &step.with {
                if let Value::String(s) = value {
                    check_template(&at(&format!("with.{}", key)), s)?;
                }
            }
        }

        Ok(())
    }
}

fn check_template(location: &str, template: &str) -> EngineResult<()> {
    parse_template(template)
        .map(|_| ())
        .map_err(|e| EngineError::parse(location, e))
}

fn check_retry(location: &str, retry: &RetryPolicy) -> EngineResult<()> {
    if retry.max_attempts == 0 {
        return Err(EngineError::config(format!(
            "{}: max-attempts must be at least 1",
            location
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::GraphErrorKind;
    use crate::workflow::models::DeploymentTarget;

    const PIPELINE: &str = r#"
name: release
env:
  REGISTRY: ghcr.io/acme
defaults:
  max-parallel: 4
  fail-fast: true
jobs:
  build:
    steps:
      - id: compile
        run: cargo build --release
      - run: echo "::set-output name=image::${{ env.REGISTRY }}/app"
        id: publish
    outputs:
      image: ${{ steps.publish.outputs.image }}
  test:
    needs: build
    strategy:
      max-parallel: 2
      matrix:
        os: [linux, macos]
        toolchain: [stable, nightly]
        exclude:
          - os: macos
            toolchain: nightly
    retry:
      max-attempts: 2
      backoff-ms: 500
    steps:
      - run: cargo test
        timeout-minutes: 10
  deploy:
    needs: [build, test]
    if: ${{ event.ref == 'refs/heads/main' }}
    environment:
      name: staging
      version: ${{ needs.build.outputs.image }}
    steps:
      - uses: notify
        with:
          channel: releases
environments:
  staging:
    deploy: ./deploy.sh
    health-check: curl -fs https://staging.example.com/health
    health-check-attempts: 5
"#;

    #[test]
    fn test_parse_full_workflow() {
        let workflow = WorkflowParser::parse_and_validate(PIPELINE).unwrap();

        assert_eq!(workflow.display_name(), "release");
        let ids: Vec<_> = workflow.jobs.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["build", "test", "deploy"]);
        assert_eq!(workflow.jobs["test"].id, "test");
        assert_eq!(workflow.defaults.max_parallel, Some(4));
        assert_eq!(workflow.defaults.fail_fast, Some(true));

        let test = &workflow.jobs["test"];
        assert_eq!(test.max_parallel(), Some(2));
        assert_eq!(test.retry.unwrap().max_attempts, 2);
        let matrix = test.matrix().unwrap();
        assert_eq!(matrix.axes.keys().collect::<Vec<_>>(), vec!["os", "toolchain"]);
        assert_eq!(matrix.exclude.len(), 1);
        assert_eq!(MatrixExpander::expand(matrix).len(), 3);

        let deploy = &workflow.jobs["deploy"];
        assert_eq!(deploy.needs.as_slice(), ["build", "test"]);
        assert!(matches!(
            deploy.environment,
            Some(DeploymentTarget::Detailed { .. })
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = WorkflowParser::parse("jobs: [unclosed").unwrap_err();
        assert!(matches!(err, EngineError::Yaml(_)));
    }

    #[test]
    fn test_validate_missing_dependency() {
        let yaml = r#"
jobs:
  deploy:
    needs: build
    steps:
      - run: echo "Deploying"
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        match err {
            EngineError::Graph(e) => assert_eq!(e.kind, GraphErrorKind::UnknownDependency),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_circular_dependency() {
        let yaml = r#"
jobs:
  a:
    needs: c
    steps:
      - run: echo "a"
  b:
    needs: a
    steps:
      - run: echo "b"
  c:
    needs: b
    steps:
      - run: echo "c"
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        match err {
            EngineError::Graph(e) => {
                assert_eq!(e.kind, GraphErrorKind::CyclicDependency);
                assert_eq!(e.path, vec!["a", "c", "b", "a"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_step_without_run_or_uses() {
        let yaml = r#"
jobs:
  build:
    steps:
      - name: Invalid step
        env:
          FOO: bar
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("must have either 'run' or 'uses'"));
    }

    #[test]
    fn test_validate_duplicate_step_ids() {
        let yaml = r#"
jobs:
  build:
    steps:
      - id: compile
        run: make
      - id: compile
        run: make install
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("duplicate step id 'compile'"));
    }

    #[test]
    fn test_validate_bad_expression_names_location() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
        if: ${{ github.ref == }}
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        match err {
            EngineError::Parse { location, .. } => assert_eq!(location, "jobs.build.steps[0].if"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_unknown_function() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: echo ${{ hashFiles('Cargo.lock') }}
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown function"));
    }

    #[test]
    fn test_validate_exclude_unknown_axis() {
        let yaml = r#"
jobs:
  test:
    strategy:
      matrix:
        os: [linux]
        exclude:
          - arch: arm64
    steps:
      - run: make test
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("arch"));
    }

    #[test]
    fn test_validate_zero_attempts() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
        retry:
          max-attempts: 0
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("max-attempts must be at least 1"));
    }

    #[test]
    fn test_validate_unknown_environment() {
        let yaml = r#"
jobs:
  ship:
    environment: production
    steps:
      - run: make
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown environment 'production'"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = WorkflowParser::from_file("/definitely/not/here.yml").unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
