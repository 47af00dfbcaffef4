//! Subcommand implementations
//!
//! 각 명령은 SQLite 저장소를 열고 상태를 복구한 뒤 실행됩니다.
//! 에러는 `tandem_foundation::Error` 그대로 반환되어 종료 코드가 결정됩니다.

use crate::render;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tandem_foundation::{Error, EventBus, KvStore, OrchestrationConfig, Result, SqliteKvStore};
use tandem_hub::{HubSpokeCoordinator, Objective, ObjectiveId};
use tandem_task::{TaskId, TaskPriority, TaskStatus};
use tracing::debug;

pub struct SubmitArgs {
    pub title: String,
    pub description: String,
    pub strategy: String,
    pub capabilities: Vec<String>,
    pub priority: String,
}

/// Restored hub plus output mode
pub struct Context {
    hub: HubSpokeCoordinator,
    json: bool,
}

impl Context {
    pub async fn open(data_dir: &Path, json: bool) -> Result<Self> {
        let config = OrchestrationConfig::load()?;
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(data_dir)?);
        let hub = HubSpokeCoordinator::from_config(&config, store, Arc::new(EventBus::new()));

        let restored = hub.orchestrator().restore().await?;
        let objectives = hub.restore().await?;
        debug!(
            data_dir = %data_dir.display(),
            tasks = restored.tasks,
            objectives,
            "Store opened"
        );
        Ok(Self { hub, json })
    }

    pub async fn submit_objective(&self, args: SubmitArgs) -> Result<()> {
        let priority = TaskPriority::from_str(&args.priority)?;
        let objective = args
            .capabilities
            .into_iter()
            .fold(Objective::new(args.title), |o, c| o.with_capability(c))
            .with_description(args.description)
            .with_strategy(args.strategy)
            .with_priority(priority);

        let id = self.hub.submit(objective).await?;
        let report = self.hub.status(id).await?;
        self.emit(&report, || render::submitted(&report))
    }

    pub async fn get_status(&self, objective_id: &str) -> Result<()> {
        let id = ObjectiveId::from_str(objective_id)?;
        let report = self.hub.status(id).await?;
        self.emit(&report, || render::objective(&report))
    }

    /// Objective id first, then task id
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let objective_id = ObjectiveId::from_str(id)?;
        match self.hub.objective(objective_id).await {
            Ok(_) => {
                let status = self.hub.cancel(objective_id).await?;
                let value = serde_json::json!({ "objectiveId": id, "status": status });
                return self.emit(&value, || format!("Objective {} {}", id, status));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let task_id = TaskId::from_str(id)?;
        let task = self
            .hub
            .orchestrator()
            .task(task_id)
            .await
            .map_err(|_| Error::NotFound(format!("No objective or task with id {}", id)))?;
        let task = if task.is_terminal() {
            task
        } else {
            self.hub.orchestrator().cancel_task(task_id).await?
        };
        self.emit(&task, || format!("Task {} {}", task.id, task.status))
    }

    pub async fn list_tasks(&self, status: Option<&str>) -> Result<()> {
        let status = status.map(TaskStatus::from_str).transpose()?;
        let tasks = self.hub.orchestrator().list_tasks(status).await;
        self.emit(&tasks, || render::task_table(&tasks))
    }

    fn emit<T: serde::Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}
