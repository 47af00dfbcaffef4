//! 오케스트레이션 시나리오 테스트
//!
//! `cargo test -p tandem-task --test workflow_scenarios`

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::{Error, EventBus, KvStore, MemoryKvStore, OrchestrationConfig, SqliteKvStore};
use tandem_task::{
    Agent, AgentCapability, AgentContext, AgentError, AgentId, ExecutionMode, HandoffCheck,
    HandoffPrecondition, RetryPolicy, Task, TaskOrchestrator, TaskPriority, TaskRequest,
    TaskResult, TaskSpec, TaskStatus, WorkflowStatus,
};
use tokio::sync::Notify;

// ============================================================================
// Helpers
// ============================================================================

type Script = dyn Fn(&Task, &AgentContext, u32) -> Result<TaskResult, AgentError> + Send + Sync;

/// Agent whose answers come from a closure; records call instants
struct ScriptedAgent {
    id: AgentId,
    capabilities: Vec<AgentCapability>,
    calls: AtomicU32,
    called_at: parking_lot::Mutex<Vec<tokio::time::Instant>>,
    script: Box<Script>,
}

impl ScriptedAgent {
    fn new(
        id: &str,
        capabilities: &[&str],
        script: impl Fn(&Task, &AgentContext, u32) -> Result<TaskResult, AgentError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: AgentId::new(id),
            capabilities: capabilities.iter().map(|c| AgentCapability::new(*c)).collect(),
            calls: AtomicU32::new(0),
            called_at: parking_lot::Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        self.capabilities.clone()
    }

    async fn invoke(&self, task: &Task, context: &mut AgentContext) -> Result<TaskResult, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.called_at.lock().push(tokio::time::Instant::now());
        (self.script)(task, context, call)
    }
}

fn orchestrator_with(config: OrchestrationConfig) -> TaskOrchestrator {
    TaskOrchestrator::assemble(
        &config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(EventBus::new()),
    )
}

fn orchestrator() -> TaskOrchestrator {
    orchestrator_with(OrchestrationConfig::default())
}

// ============================================================================
// Workflow folding
// ============================================================================

#[tokio::test]
async fn test_sequential_failure_cancels_remaining_tasks() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("worker", &["rust"], |task, _, _| {
        if task.description == "compile" {
            Err(AgentError::Terminal("type error in lib.rs".into()))
        } else {
            Ok(TaskResult::success("ok"))
        }
    });
    orch.delegation().register_agent(agent).await.unwrap();
    let mut changes = orch.subscribe_status();

    let wf = orch.create_workflow("build", ExecutionMode::Sequential).await.unwrap();
    let fetch = orch.add_task(wf, TaskSpec::new("fetch").with_capability("rust")).await.unwrap();
    let compile = orch.add_task(wf, TaskSpec::new("compile").with_capability("rust")).await.unwrap();
    let package = orch.add_task(wf, TaskSpec::new("package").with_capability("rust")).await.unwrap();

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);

    assert_eq!(orch.task(fetch).await.unwrap().status, TaskStatus::Succeeded);
    let failed = orch.task(compile).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("type error in lib.rs"));

    let cancelled = orch.task(package).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.started_at.is_none());

    while let Ok(change) = changes.try_recv() {
        if change.task_id == package {
            assert_ne!(change.to, TaskStatus::Running);
            assert_ne!(change.to, TaskStatus::Assigned);
        }
    }
}

#[tokio::test]
async fn test_missing_capability_leaves_task_pending() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("rustacean", &["rust"], |_, _, _| Ok(TaskResult::success("ok")));
    orch.delegation().register_agent(agent).await.unwrap();

    let wf = orch.create_workflow("lint", ExecutionMode::Parallel).await.unwrap();
    let lint = orch
        .add_task(wf, TaskSpec::new("lint scripts").with_capability("python-lint"))
        .await
        .unwrap();

    let task = orch.task(lint).await.unwrap();
    let request = TaskRequest::for_task(&task, &RetryPolicy::default());
    let err = orch.delegation().delegate(&request).await.unwrap_err();
    assert!(matches!(err, Error::NoEligibleAgent(ref caps) if caps == &["python-lint".to_string()]));

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].0, lint);
    assert!(report.blocked[0].1.contains("python-lint"));
    assert_eq!(orch.task(lint).await.unwrap().status, TaskStatus::Pending);
    assert_eq!(report.status, WorkflowStatus::Pending);
}

#[tokio::test]
async fn test_optional_failure_does_not_fail_parallel_workflow() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("worker", &["docs", "rust"], |task, _, _| {
        if task.description == "docs" {
            Err(AgentError::Terminal("no writer".into()))
        } else {
            Ok(TaskResult::success("ok"))
        }
    });
    orch.delegation().register_agent(agent).await.unwrap();

    let wf = orch.create_workflow("release", ExecutionMode::Parallel).await.unwrap();
    let build = orch.add_task(wf, TaskSpec::new("build").with_capability("rust")).await.unwrap();
    let docs = orch
        .add_task(wf, TaskSpec::new("docs").with_capability("docs").depends_on(build).optional())
        .await
        .unwrap();
    orch.add_task(wf, TaskSpec::new("publish").with_capability("rust").depends_on(docs))
        .await
        .unwrap();

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(orch.task(docs).await.unwrap().status, TaskStatus::Failed);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_bounds() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("flaky", &["net"], |_, _, call| {
        if call < 3 {
            Err(AgentError::Retryable(format!("connection reset #{}", call)))
        } else {
            Ok(TaskResult::success("fetched"))
        }
    });
    orch.delegation().register_agent(agent.clone()).await.unwrap();

    let wf = orch.create_workflow("fetch", ExecutionMode::Sequential).await.unwrap();
    let task = orch
        .add_task(
            wf,
            TaskSpec::new("fetch").with_capability("net").with_retry_policy(
                RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
                    .with_jitter(0.2),
            ),
        )
        .await
        .unwrap();

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let calls = agent.called_at.lock().clone();
    assert_eq!(calls.len(), 3);
    let first = calls[1] - calls[0];
    let second = calls[2] - calls[1];
    assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1200), "{:?}", first);
    assert!(second >= Duration::from_secs(2) && second <= Duration::from_millis(2400), "{:?}", second);

    let task = orch.task(task).await.unwrap();
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.retry_history.len(), 2);
    assert_eq!(task.retry_history[1].error, "connection reset #2");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_with_history() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("flaky", &["net"], |_, _, call| {
        Err(AgentError::Retryable(format!("timeout #{}", call)))
    });
    orch.delegation().register_agent(agent).await.unwrap();

    let wf = orch.create_workflow("fetch", ExecutionMode::Sequential).await.unwrap();
    let task = orch
        .add_task(
            wf,
            TaskSpec::new("fetch")
                .with_capability("net")
                .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(100))),
        )
        .await
        .unwrap();

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);

    let task = orch.task(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.retry_history.len(), 3);
    assert_eq!(task.last_error.as_deref(), Some("timeout #3"));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_retried() {
    let mut config = OrchestrationConfig::default();
    config.delegation.attempt_timeout_secs = 5;
    let orch = orchestrator_with(config);

    struct Hangs {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for Hangs {
        fn id(&self) -> AgentId {
            AgentId::new("hangs-once")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("net")]
        }
        async fn invoke(&self, _task: &Task, _ctx: &mut AgentContext) -> Result<TaskResult, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(TaskResult::success("answered"))
        }
    }

    let agent = Arc::new(Hangs {
        calls: AtomicU32::new(0),
    });
    orch.delegation().register_agent(agent.clone()).await.unwrap();

    let wf = orch.create_workflow("fetch-retry", ExecutionMode::Sequential).await.unwrap();
    let task = orch
        .add_task(
            wf,
            TaskSpec::new("fetch")
                .with_capability("net")
                .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(100))),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(5));

    let task = orch.task(task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    assert_eq!(task.retry_history.len(), 1);
    assert!(task.retry_history[0].error.contains("timed out"), "{}", task.retry_history[0].error);
    assert_eq!(orch.allocator().usage().in_use, 0);
}

#[tokio::test]
async fn test_agent_sees_running_assignment() {
    let orch = orchestrator();
    let agent = ScriptedAgent::new("observer", &["audit"], |task, _, _| {
        if task.status == TaskStatus::Running
            && task.assigned_agent == Some(AgentId::new("observer"))
            && task.started_at.is_some()
        {
            Ok(TaskResult::success("saw itself"))
        } else {
            Err(AgentError::Terminal(format!("stale snapshot: {}", task.status)))
        }
    });
    orch.delegation().register_agent(agent).await.unwrap();

    let wf = orch.create_workflow("audit", ExecutionMode::Sequential).await.unwrap();
    let task = orch.add_task(wf, TaskSpec::new("audit").with_capability("audit")).await.unwrap();

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(orch.task(task).await.unwrap().status, TaskStatus::Succeeded);
}

// ============================================================================
// Handoff
// ============================================================================

#[tokio::test]
async fn test_handoff_during_execution_is_idempotent() {
    let orch = orchestrator();
    let reviewer = AgentId::new("reviewer");
    let target = reviewer.clone();
    let drafter = ScriptedAgent::new("drafter", &["writing"], move |_, _, _| {
        Ok(TaskResult::handoff("needs a second pair of eyes", Some(target.clone())))
    });
    let finisher = ScriptedAgent::new("reviewer", &["writing"], |_, context, _| {
        Ok(TaskResult::success("approved")
            .with_data(serde_json::json!({ "owners": context.owners })))
    });
    orch.delegation().register_agent(drafter).await.unwrap();
    orch.delegation().register_agent(finisher).await.unwrap();

    let wf = orch.create_workflow("doc", ExecutionMode::Sequential).await.unwrap();
    let task_id = orch.add_task(wf, TaskSpec::new("write").with_capability("writing")).await.unwrap();
    orch.run_workflow(wf).await.unwrap();

    let task = orch.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.assigned_agent, Some(reviewer.clone()));
    assert_eq!(task.handoff_sequence, 1);
    assert_eq!(
        task.output_field("owners"),
        Some(&serde_json::json!(["drafter", "reviewer"]))
    );

    let history = orch.handoff_manager().history(task_id).await;
    assert_eq!(history.len(), 1);

    // Replaying the committed sequence returns the stored result
    let replay = orch.handoff(task_id, 1, &reviewer).await.unwrap();
    assert_eq!(replay, history[0]);
    assert_eq!(orch.handoff_manager().history(task_id).await.len(), 1);
    assert_eq!(orch.task(task_id).await.unwrap().version, task.version);
}

#[tokio::test]
async fn test_replaying_older_handoff_keeps_latest_owner() {
    let orch = orchestrator();
    for id in ["a", "b", "c"] {
        orch.delegation()
            .register_agent(ScriptedAgent::new(id, &["review"], |_, _, _| Ok(TaskResult::success("ok"))))
            .await
            .unwrap();
    }

    let wf = orch.create_workflow("relay", ExecutionMode::Sequential).await.unwrap();
    let task_id = orch.add_task(wf, TaskSpec::new("relay").with_capability("review")).await.unwrap();
    orch.assign(task_id, &AgentId::new("a")).await.unwrap();
    orch.start(task_id).await.unwrap();

    let first = orch.handoff(task_id, 1, &AgentId::new("b")).await.unwrap();
    orch.handoff(task_id, 2, &AgentId::new("c")).await.unwrap();
    let before = orch.task(task_id).await.unwrap();

    let replay = orch.handoff(task_id, 1, &AgentId::new("b")).await.unwrap();
    assert_eq!(replay, first);

    let after = orch.task(task_id).await.unwrap();
    assert_eq!(after.assigned_agent, Some(AgentId::new("c")));
    assert_eq!(after.version, before.version);
    assert_eq!(after.handoff_sequence, 2);
    assert_eq!(orch.handoff_manager().owner(task_id).await, Some(AgentId::new("c")));
}

#[tokio::test(start_paused = true)]
async fn test_handoff_precondition_timeout_keeps_current_agent() {
    struct Stalls;

    #[async_trait]
    impl HandoffPrecondition for Stalls {
        fn name(&self) -> &str {
            "external_approval"
        }

        async fn check(&self, _check: &HandoffCheck<'_>) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    let mut config = OrchestrationConfig::default();
    config.handoff.timeout_secs = 2;
    let orch = orchestrator_with(config);
    orch.handoff_manager().register_precondition(Arc::new(Stalls)).await;

    let target = AgentId::new("reviewer");
    let asked = target.clone();
    let drafter = ScriptedAgent::new("drafter", &["writing"], move |_, _, call| {
        if call == 1 {
            Ok(TaskResult::handoff("approval needed", Some(asked.clone())))
        } else {
            Ok(TaskResult::success("shipped without review"))
        }
    });
    let reviewer = ScriptedAgent::new("reviewer", &["writing"], |_, _, _| Ok(TaskResult::success("reviewed")));
    orch.delegation().register_agent(drafter.clone()).await.unwrap();
    orch.delegation().register_agent(reviewer.clone()).await.unwrap();

    let wf = orch.create_workflow("doc", ExecutionMode::Sequential).await.unwrap();
    let task_id = orch.add_task(wf, TaskSpec::new("draft").with_capability("writing")).await.unwrap();
    let started = tokio::time::Instant::now();
    orch.run_workflow(wf).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    let task = orch.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.assigned_agent, Some(AgentId::new("drafter")));
    assert_eq!(task.handoff_sequence, 0);
    assert_eq!(drafter.calls.load(Ordering::SeqCst), 2);
    assert_eq!(reviewer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handoff_to_incapable_agent_rejected() {
    let orch = orchestrator();
    let target = AgentId::new("designer");
    let asked = target.clone();
    let coder = ScriptedAgent::new("coder", &["rust"], move |_, _, call| {
        if call == 1 {
            Ok(TaskResult::handoff("ui work", Some(asked.clone())))
        } else {
            Ok(TaskResult::success("did it myself"))
        }
    });
    let designer = ScriptedAgent::new("designer", &["figma"], |_, _, _| Ok(TaskResult::success("ui")));
    orch.delegation().register_agent(coder.clone()).await.unwrap();
    orch.delegation().register_agent(designer).await.unwrap();

    let wf = orch.create_workflow("ui", ExecutionMode::Sequential).await.unwrap();
    let task_id = orch.add_task(wf, TaskSpec::new("ui").with_capability("rust")).await.unwrap();
    orch.run_workflow(wf).await.unwrap();

    let task = orch.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.assigned_agent, Some(AgentId::new("coder")));
    assert_eq!(task.handoff_sequence, 0);
    assert_eq!(coder.calls.load(Ordering::SeqCst), 2);
    assert!(orch.handoff_manager().history(task_id).await.is_empty());
}

// ============================================================================
// Resources
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_bound_holds_across_parallel_tasks() {
    let mut config = OrchestrationConfig::default();
    config.allocator.capacity = 2;
    let orch = orchestrator_with(config);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    struct Slow {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for Slow {
        fn id(&self) -> AgentId {
            AgentId::new("slow")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("io")]
        }
        async fn invoke(&self, _task: &Task, _ctx: &mut AgentContext) -> Result<TaskResult, AgentError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(TaskResult::success("done"))
        }
    }

    orch.delegation()
        .register_agent(Arc::new(Slow {
            running: running.clone(),
            peak: peak.clone(),
        }))
        .await
        .unwrap();

    let wf = orch.create_workflow("fanout", ExecutionMode::Parallel).await.unwrap();
    for i in 0..6 {
        orch.add_task(wf, TaskSpec::new(format!("job-{}", i)).with_capability("io"))
            .await
            .unwrap();
    }

    let report = orch.run_workflow(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(orch.allocator().usage().in_use, 0);
    assert_eq!(orch.allocator().usage().allocations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_preempted_task_is_requeued_and_finishes() {
    let mut config = OrchestrationConfig::default();
    config.allocator.capacity = 1;
    config.allocator.preemption_grace_secs = 0;
    let orch = orchestrator_with(config);
    let listener = orch.spawn_preemption_listener();

    struct Batch {
        calls: AtomicU32,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Agent for Batch {
        fn id(&self) -> AgentId {
            AgentId::new("batch")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("batch")]
        }
        async fn invoke(&self, _task: &Task, _ctx: &mut AgentContext) -> Result<TaskResult, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(TaskResult::success("batch done"))
        }
    }

    let started = Arc::new(Notify::new());
    orch.delegation()
        .register_agent(Arc::new(Batch {
            calls: AtomicU32::new(0),
            started: started.clone(),
        }))
        .await
        .unwrap();
    orch.delegation()
        .register_agent(ScriptedAgent::new("pager", &["urgent"], |_, _, _| {
            Ok(TaskResult::success("paged"))
        }))
        .await
        .unwrap();

    let low_wf = orch.create_workflow("nightly", ExecutionMode::Sequential).await.unwrap();
    let low = orch
        .add_task(
            low_wf,
            TaskSpec::new("reindex")
                .with_capability("batch")
                .with_priority(TaskPriority::Low),
        )
        .await
        .unwrap();
    let low_run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_workflow(low_wf).await })
    };
    started.notified().await;

    let high_wf = orch.create_workflow("incident", ExecutionMode::Sequential).await.unwrap();
    orch.add_task(
        high_wf,
        TaskSpec::new("page on-call")
            .with_capability("urgent")
            .with_priority(TaskPriority::Critical),
    )
    .await
    .unwrap();

    let high = tokio::time::timeout(Duration::from_secs(10), orch.run_workflow(high_wf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(high.status, WorkflowStatus::Completed);

    let low_report = tokio::time::timeout(Duration::from_secs(10), low_run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(low_report.status, WorkflowStatus::Completed);

    let low = orch.task(low).await.unwrap();
    assert_eq!(low.status, TaskStatus::Succeeded);
    assert_eq!(low.retry_count, 0);
    assert_eq!(orch.allocator().usage().total_preemptions, 1);
    assert_eq!(orch.allocator().usage().in_use, 0);
    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_critical_task_preempts_after_grace_period() {
    let mut config = OrchestrationConfig::default();
    config.allocator.capacity = 1;
    config.allocator.preemption_grace_secs = 30;
    config.allocator.reserve_timeout_secs = 120;
    let orch = orchestrator_with(config);
    let listener = orch.spawn_preemption_listener();

    struct Indexer {
        calls: AtomicU32,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Agent for Indexer {
        fn id(&self) -> AgentId {
            AgentId::new("indexer")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("batch")]
        }
        async fn invoke(&self, _task: &Task, _ctx: &mut AgentContext) -> Result<TaskResult, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(TaskResult::success("indexed"))
        }
    }

    let started = Arc::new(Notify::new());
    orch.delegation()
        .register_agent(Arc::new(Indexer {
            calls: AtomicU32::new(0),
            started: started.clone(),
        }))
        .await
        .unwrap();
    orch.delegation()
        .register_agent(ScriptedAgent::new("pager", &["urgent"], |_, _, _| {
            Ok(TaskResult::success("paged"))
        }))
        .await
        .unwrap();

    let low_wf = orch.create_workflow("nightly", ExecutionMode::Sequential).await.unwrap();
    let low = orch
        .add_task(
            low_wf,
            TaskSpec::new("reindex")
                .with_capability("batch")
                .with_priority(TaskPriority::Low),
        )
        .await
        .unwrap();
    let low_run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_workflow(low_wf).await })
    };
    started.notified().await;

    let high_wf = orch.create_workflow("incident", ExecutionMode::Sequential).await.unwrap();
    orch.add_task(
        high_wf,
        TaskSpec::new("page on-call")
            .with_capability("urgent")
            .with_priority(TaskPriority::Critical),
    )
    .await
    .unwrap();

    let waiting_since = tokio::time::Instant::now();
    let high = orch.run_workflow(high_wf).await.unwrap();
    assert_eq!(high.status, WorkflowStatus::Completed);
    // Granted once the low holding left its grace period, well before the reserve timeout
    let waited = waiting_since.elapsed();
    assert!(waited >= Duration::from_secs(30), "{:?}", waited);
    assert!(waited < Duration::from_secs(60), "{:?}", waited);

    let low_report = low_run.await.unwrap().unwrap();
    assert_eq!(low_report.status, WorkflowStatus::Completed);

    let low = orch.task(low).await.unwrap();
    assert_eq!(low.status, TaskStatus::Succeeded);
    assert_eq!(low.retry_count, 0);
    assert_eq!(orch.allocator().usage().total_preemptions, 1);
    assert_eq!(orch.allocator().usage().in_use, 0);
    listener.abort();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_workflow_interrupts_running_task() {
    let orch = orchestrator();
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicU32::new(0));

    struct Sleeper {
        started: Arc<Notify>,
        finished: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Agent for Sleeper {
        fn id(&self) -> AgentId {
            AgentId::new("sleeper")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("slow")]
        }
        async fn invoke(&self, _task: &Task, _ctx: &mut AgentContext) -> Result<TaskResult, AgentError> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(TaskResult::success("too late"))
        }
    }

    orch.delegation()
        .register_agent(Arc::new(Sleeper {
            started: started.clone(),
            finished: finished.clone(),
        }))
        .await
        .unwrap();

    let wf = orch.create_workflow("long", ExecutionMode::Sequential).await.unwrap();
    let first = orch.add_task(wf, TaskSpec::new("first").with_capability("slow")).await.unwrap();
    let second = orch.add_task(wf, TaskSpec::new("second").with_capability("slow")).await.unwrap();

    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_workflow(wf).await })
    };
    started.notified().await;

    assert_eq!(orch.cancel_workflow(wf).await.unwrap(), WorkflowStatus::Cancelled);
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(orch.task(first).await.unwrap().status, TaskStatus::Cancelled);
    assert_eq!(orch.task(second).await.unwrap().status, TaskStatus::Cancelled);
    assert!(orch.task(first).await.unwrap().result.is_none());
    assert_eq!(orch.allocator().usage().in_use, 0);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_restore_from_sqlite_requeues_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestrationConfig::default();

    let (wf, task) = {
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(dir.path()).unwrap());
        let orch = TaskOrchestrator::assemble(&config, store, Arc::new(EventBus::new()));
        let wf = orch.create_workflow("resume", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("migrate").with_capability("sql")).await.unwrap();
        orch.seal_workflow(wf).await.unwrap();
        orch.assign(task, &AgentId::new("gone")).await.unwrap();
        orch.start(task).await.unwrap();
        (wf, task)
    };

    let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(dir.path()).unwrap());
    let events = Arc::new(EventBus::new());
    let orch = TaskOrchestrator::assemble(&config, store, events.clone());
    let restored = orch.restore().await.unwrap();
    assert_eq!(restored.requeued, 1);
    assert_eq!(orch.task(task).await.unwrap().status, TaskStatus::Pending);
    assert_eq!(
        events.history(None).await.last().map(|e| e.event_type.clone()),
        Some("system.restored".to_string())
    );

    orch.delegation()
        .register_agent(ScriptedAgent::new("dba", &["sql"], |_, _, _| Ok(TaskResult::success("migrated"))))
        .await
        .unwrap();
    let report = orch.drive(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_writers_conflict() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let config = OrchestrationConfig::default();
    let first = TaskOrchestrator::assemble(&config, store.clone(), Arc::new(EventBus::new()));
    let wf = first.create_workflow("shared", ExecutionMode::Sequential).await.unwrap();
    let task = first.add_task(wf, TaskSpec::new("t")).await.unwrap();

    let second = TaskOrchestrator::assemble(&config, store, Arc::new(EventBus::new()));
    second.restore().await.unwrap();

    first.assign(task, &AgentId::new("a")).await.unwrap();
    let err = second.assign(task, &AgentId::new("b")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(second.task(task).await.unwrap().status, TaskStatus::Pending);
}
