//! Built-in templates

use super::template::{BranchCondition, ConditionalBranch, StepSpec, WorkflowStep, WorkflowTemplate};
use crate::workflow::ExecutionMode;

fn about(subject: &Option<String>) -> String {
    subject
        .as_deref()
        .map(|s| format!(" for {}", s))
        .unwrap_or_default()
}

// ============================================================================
// TDD
// ============================================================================

/// write-tests → implement → run-tests → `tests_pass` ? review : fix loop
///
/// The fix loop is unrolled: each iteration adds `fix-N` and `run-tests-N`
/// followed by another branch. After the last iteration the workflow escalates.
#[derive(Debug, Clone)]
pub struct TddWorkflow {
    subject: Option<String>,
    max_fix_iterations: u32,
}

impl Default for TddWorkflow {
    fn default() -> Self {
        Self {
            subject: None,
            max_fix_iterations: 3,
        }
    }
}

impl TddWorkflow {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    pub fn with_max_fix_iterations(mut self, iterations: u32) -> Self {
        self.max_fix_iterations = iterations;
        self
    }

    fn review(&self) -> StepSpec {
        StepSpec::new("review", format!("Review the change{}", about(&self.subject)))
            .with_capability("review")
    }

    /// Branch after `run_step`; `iteration` fixes already attempted
    fn check(&self, run_step: &str, iteration: u32) -> ConditionalBranch {
        let name = if iteration == 0 {
            "tests_pass".to_string()
        } else {
            format!("tests_pass-{}", iteration)
        };
        let branch = ConditionalBranch::new(
            name,
            BranchCondition::output_equals(run_step, "tests_pass", true),
        )
        .then(self.review());

        if iteration >= self.max_fix_iterations {
            return branch.otherwise(
                StepSpec::new(
                    "escalate",
                    format!(
                        "Tests still failing after {} fix attempts{}; escalate",
                        iteration,
                        about(&self.subject)
                    ),
                )
                .with_capability("review"),
            );
        }

        let next = iteration + 1;
        let fix = format!("fix-{}", next);
        let rerun = format!("run-tests-{}", next);
        branch
            .otherwise(
                StepSpec::new(&fix, format!("Fix failing tests{}", about(&self.subject)))
                    .with_capability("coding")
                    .depends_on(run_step),
            )
            .otherwise(
                StepSpec::new(&rerun, "Run the test suite")
                    .with_capability("testing")
                    .depends_on(&fix),
            )
            .otherwise(self.check(&rerun, next))
    }
}

impl WorkflowTemplate for TddWorkflow {
    fn name(&self) -> &str {
        "tdd"
    }

    fn description(&self) -> &str {
        "Test-driven development with a bounded fix loop"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    fn steps(&self) -> Vec<WorkflowStep> {
        vec![
            StepSpec::new("write-tests", format!("Write failing tests{}", about(&self.subject)))
                .with_capability("testing")
                .into(),
            StepSpec::new("implement", format!("Implement{}", about(&self.subject)))
                .with_capability("coding")
                .depends_on("write-tests")
                .into(),
            StepSpec::new("run-tests", "Run the test suite")
                .with_capability("testing")
                .depends_on("implement")
                .into(),
            self.check("run-tests", 0).into(),
        ]
    }
}

// ============================================================================
// Bug fix
// ============================================================================

/// reproduce → diagnose → fix → verify → `verified` ? review : escalate
#[derive(Debug, Clone, Default)]
pub struct BugFixWorkflow {
    subject: Option<String>,
}

impl BugFixWorkflow {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }
}

impl WorkflowTemplate for BugFixWorkflow {
    fn name(&self) -> &str {
        "bug-fix"
    }

    fn description(&self) -> &str {
        "Reproduce, diagnose, fix and verify a defect"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    fn steps(&self) -> Vec<WorkflowStep> {
        let subject = about(&self.subject);
        vec![
            StepSpec::new("reproduce", format!("Reproduce the bug{}", subject))
                .with_capability("testing")
                .into(),
            StepSpec::new("diagnose", format!("Find the root cause{}", subject))
                .with_capability("debugging")
                .into(),
            StepSpec::new("fix", format!("Fix the bug{}", subject))
                .with_capability("coding")
                .into(),
            StepSpec::new("verify", "Verify the fix against the reproduction")
                .with_capability("testing")
                .into(),
            ConditionalBranch::new(
                "verified",
                BranchCondition::output_equals("verify", "verified", true),
            )
            .then(
                StepSpec::new("review", format!("Review the fix{}", subject))
                    .with_capability("review"),
            )
            .otherwise(
                StepSpec::new("escalate", format!("Fix could not be verified{}; escalate", subject))
                    .with_capability("review"),
            )
            .into(),
        ]
    }
}

// ============================================================================
// Feature development
// ============================================================================

/// design → implement-core → (tests ∥ docs) → integrate → review
///
/// Runs in parallel mode; `docs` is optional.
#[derive(Debug, Clone, Default)]
pub struct FeatureDevelopmentWorkflow {
    subject: Option<String>,
}

impl FeatureDevelopmentWorkflow {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }
}

impl WorkflowTemplate for FeatureDevelopmentWorkflow {
    fn name(&self) -> &str {
        "feature-development"
    }

    fn description(&self) -> &str {
        "Design, build, test and document a feature"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Parallel
    }

    fn steps(&self) -> Vec<WorkflowStep> {
        let subject = about(&self.subject);
        vec![
            StepSpec::new("design", format!("Design{}", subject))
                .with_capability("design")
                .into(),
            StepSpec::new("implement-core", format!("Implement the core{}", subject))
                .with_capability("coding")
                .depends_on("design")
                .into(),
            StepSpec::new("tests", "Write tests for the new code")
                .with_capability("testing")
                .depends_on("implement-core")
                .into(),
            StepSpec::new("docs", "Document the feature")
                .with_capability("docs")
                .depends_on("implement-core")
                .optional()
                .into(),
            StepSpec::new("integrate", "Integrate with the rest of the system")
                .with_capability("coding")
                .depends_on("tests")
                .depends_on("docs")
                .into(),
            StepSpec::new("review", format!("Review the feature{}", subject))
                .with_capability("review")
                .depends_on("integrate")
                .into(),
        ]
    }
}
