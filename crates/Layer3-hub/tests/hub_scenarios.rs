//! 허브/스포크 시나리오 테스트
//!
//! `cargo test -p tandem-hub --test hub_scenarios`

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::{EventBus, HubSettings, MemoryKvStore, OrchestrationConfig};
use tandem_hub::{
    FixedTemplateStrategy, HubSpokeCoordinator, Objective, ObjectiveStatus, SpokeAgent,
    SpokeStatus, SubTaskSpec,
};
use tandem_task::{
    Agent, AgentCapability, AgentContext, AgentError, AgentId, Task, TaskResult, TaskStatus,
};

// ============================================================================
// Helpers
// ============================================================================

type Script = dyn Fn(&Task) -> Result<TaskResult, AgentError> + Send + Sync;

struct Worker {
    id: AgentId,
    capabilities: Vec<AgentCapability>,
    calls: AtomicU32,
    /// Never answers
    hang: bool,
    script: Box<Script>,
}

impl Worker {
    fn new(
        id: &str,
        capabilities: &[&str],
        script: impl Fn(&Task) -> Result<TaskResult, AgentError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: AgentId::new(id),
            capabilities: capabilities.iter().map(|c| AgentCapability::new(*c)).collect(),
            calls: AtomicU32::new(0),
            hang: false,
            script: Box::new(script),
        })
    }

    fn ok(id: &str, capabilities: &[&str]) -> Arc<Self> {
        let name = id.to_string();
        Self::new(id, capabilities, move |task| {
            Ok(TaskResult::success(format!("{} did {}", name, task.description)))
        })
    }

    fn hanging(id: &str, capabilities: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: AgentId::new(id),
            capabilities: capabilities.iter().map(|c| AgentCapability::new(*c)).collect(),
            calls: AtomicU32::new(0),
            hang: true,
            script: Box::new(|_| Ok(TaskResult::success("unreachable"))),
        })
    }
}

#[async_trait]
impl Agent for Worker {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        self.capabilities.clone()
    }

    async fn invoke(&self, task: &Task, _context: &mut AgentContext) -> Result<TaskResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        (self.script)(task)
    }
}

fn hub_with(settings: HubSettings) -> HubSpokeCoordinator {
    let config = OrchestrationConfig {
        hub: settings,
        ..Default::default()
    };
    HubSpokeCoordinator::from_config(
        &config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(EventBus::new()),
    )
}

fn hub() -> HubSpokeCoordinator {
    hub_with(HubSettings::default())
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_objective_completes_across_spokes() {
    let hub = hub();
    hub.register_spoke(SpokeAgent::new(Worker::ok("spoke-rust", &["rust"])))
        .await
        .unwrap();
    hub.register_spoke(SpokeAgent::new(Worker::ok("spoke-docs", &["docs"])))
        .await
        .unwrap();

    let id = hub
        .submit(
            Objective::new("release 1.0")
                .with_capability("rust")
                .with_capability("docs"),
        )
        .await
        .unwrap();
    let report = hub.run(id).await.unwrap();

    assert_eq!(report.status(), ObjectiveStatus::Done);
    assert_eq!(report.subtasks.len(), 2);
    for sub in &report.subtasks {
        assert_eq!(sub.task_status, TaskStatus::Succeeded);
        assert_eq!(sub.subtask.status, SpokeStatus::Done);
    }
    assert_eq!(
        report.subtasks[0].subtask.spoke,
        Some(AgentId::new("spoke-rust"))
    );
    assert_eq!(
        report.subtasks[1].subtask.spoke,
        Some(AgentId::new("spoke-docs"))
    );
    assert!(report.redelegations().is_empty());

    let spokes = hub.spokes();
    assert!(spokes.iter().all(|s| s.status == SpokeStatus::Done && s.completed == 1));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_spoke_is_redelegated() {
    let hub = hub_with(HubSettings {
        liveness_timeout_secs: 5,
        liveness_check_interval_ms: 500,
        ..Default::default()
    });
    let silent = Worker::hanging("spoke-a", &["rust"]);
    let backup = Worker::ok("spoke-b", &["rust"]);
    hub.register_spoke(SpokeAgent::new(silent.clone())).await.unwrap();
    hub.register_spoke(SpokeAgent::new(backup.clone())).await.unwrap();
    let mut events = hub.orchestrator().events().receiver();

    let id = hub
        .submit(Objective::new("port parser").with_capability("rust"))
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    let report = hub.run(id).await.unwrap();

    assert_eq!(report.status(), ObjectiveStatus::Done);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(silent.calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup.calls.load(Ordering::SeqCst), 1);

    let redelegations = report.redelegations();
    assert_eq!(redelegations.len(), 1);
    assert_eq!(redelegations[0].from, AgentId::new("spoke-a"));
    assert_eq!(redelegations[0].to, AgentId::new("spoke-b"));
    assert_eq!(report.subtasks[0].subtask.spoke, Some(AgentId::new("spoke-b")));
    // Redelegation is not a failed attempt
    assert_eq!(report.subtasks[0].attempts, 0);

    let spokes = hub.spokes();
    let a = spokes.iter().find(|s| s.id.as_str() == "spoke-a").unwrap();
    assert_eq!(a.status, SpokeStatus::Unreachable);

    let mut saw_redelegated = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == "spoke.redelegated" {
            saw_redelegated = true;
        }
    }
    assert!(saw_redelegated);

    // A heartbeat brings the spoke back
    hub.heartbeat(&AgentId::new("spoke-a")).await.unwrap();
    let spokes = hub.spokes();
    let a = spokes.iter().find(|s| s.id.as_str() == "spoke-a").unwrap();
    assert_eq!(a.status, SpokeStatus::Idle);
}

#[tokio::test]
async fn test_recursive_refinement_appends_subtasks() {
    let hub = hub();
    let worker = Worker::new("splitter", &["rust"], |task| {
        if task.description.starts_with("part") {
            return Ok(TaskResult::success(format!("finished {}", task.description)));
        }
        Ok(TaskResult::success("split in two").with_data(serde_json::json!({
            "subtasks": [
                { "description": "part a", "capabilities": ["rust"] },
                { "description": "part b", "capabilities": ["rust"], "dependsOn": [0] }
            ]
        })))
    });
    hub.register_spoke(SpokeAgent::new(worker.clone())).await.unwrap();

    let id = hub
        .submit(
            Objective::new("rewrite lexer")
                .with_capability("rust")
                .with_strategy("recursive"),
        )
        .await
        .unwrap();
    let report = hub.run(id).await.unwrap();

    assert_eq!(report.status(), ObjectiveStatus::Done);
    assert_eq!(report.subtasks.len(), 3);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);

    let root = &report.subtasks[0];
    assert_eq!(root.subtask.depth, 0);
    assert_eq!(root.output.as_deref(), Some("split in two"));
    assert!(root.subtask.refined);

    let parts: Vec<_> = report.subtasks[1..].iter().map(|s| s.subtask.spec.description.as_str()).collect();
    assert_eq!(parts, vec!["part a", "part b"]);
    assert!(report.subtasks[1..].iter().all(|s| s.subtask.depth == 1));
    assert!(report.subtasks.iter().all(|s| s.task_status == TaskStatus::Succeeded));
}

#[tokio::test]
async fn test_required_failure_fails_objective() {
    let hub = hub();
    hub.register_strategy(Arc::new(FixedTemplateStrategy::new(
        "pipeline",
        vec![
            SubTaskSpec::new("Build"),
            SubTaskSpec::new("Test").after(0),
            SubTaskSpec::new("Publish").after(1),
        ],
    )));
    let worker = Worker::new("ci", &["rust"], |task| {
        if task.description.starts_with("Test") {
            Err(AgentError::terminal("3 tests failed"))
        } else {
            Ok(TaskResult::success("ok"))
        }
    });
    hub.register_spoke(SpokeAgent::new(worker)).await.unwrap();

    let id = hub
        .submit(
            Objective::new("ship crate")
                .with_capability("rust")
                .with_strategy("pipeline"),
        )
        .await
        .unwrap();
    let report = hub.run(id).await.unwrap();

    assert_eq!(report.status(), ObjectiveStatus::Failed);
    let last_error = report.objective.last_error.clone().unwrap();
    assert!(last_error.contains("3 tests failed"));

    let statuses: Vec<TaskStatus> = report.subtasks.iter().map(|s| s.task_status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Cancelled]
    );
    assert_eq!(report.unsuccessful().count(), 2);
    assert_eq!(report.subtasks[1].subtask.status, SpokeStatus::Failed);
}

#[tokio::test]
async fn test_objective_without_capable_spoke_stays_running() {
    let hub = hub();
    hub.register_spoke(SpokeAgent::new(Worker::ok("spoke-rust", &["rust"])))
        .await
        .unwrap();

    let id = hub
        .submit(Objective::new("lint scripts").with_capability("python-lint"))
        .await
        .unwrap();
    let report = hub.run(id).await.unwrap();

    assert_eq!(report.status(), ObjectiveStatus::Running);
    assert_eq!(report.subtasks[0].task_status, TaskStatus::Pending);
    assert!(report
        .objective
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("python-lint")));
}
