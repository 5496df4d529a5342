// Output formatting helpers for CLI commands

use conveyor_engine::{JobStatus, StepConclusion};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print step output (indented)
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Print step error output (indented, red)
pub fn step_error(line: &str) {
    eprintln!("\x1b[31m        | {}\x1b[0m", line);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Short label and color for a job status
pub fn job_label(status: JobStatus) -> (&'static str, fn(&str)) {
    match status {
        JobStatus::Success => ("OK", dim_success),
        JobStatus::Failure => ("FAIL", dim_failure),
        JobStatus::Cancelled => ("CANCELLED", dim_failure),
        JobStatus::Skipped => ("SKIPPED", dim),
        JobStatus::Pending | JobStatus::Running => ("...", dim),
    }
}

/// Short label for a step conclusion
pub fn step_label(conclusion: StepConclusion) -> &'static str {
    match conclusion {
        StepConclusion::Success => "OK",
        StepConclusion::Failure => "FAIL",
        StepConclusion::Skipped => "SKIP",
        StepConclusion::Cancelled => "CANCELLED",
    }
}
