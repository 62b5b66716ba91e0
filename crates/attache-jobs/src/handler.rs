//! Task handlers, one per task kind.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use attache_core::{PurgeTask, QueuedTask, TaskKind};

/// Context provided to task handlers.
pub struct JobContext {
    /// The claimed task.
    pub task: QueuedTask,
}

impl JobContext {
    pub fn new(task: QueuedTask) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn payload(&self) -> &PurgeTask {
        &self.task.payload
    }

    /// Attempt number of this execution, starting at 1.
    pub fn attempt(&self) -> i32 {
        self.task.attempts
    }
}

/// Result of task execution.
#[derive(Debug)]
pub enum JobResult {
    /// Task completed with optional result data.
    Success(Option<JsonValue>),
    /// Task failed permanently; the queue still counts it as an attempt.
    Failed(String),
    /// Task hit a transient error and should run again.
    Retry(String),
}

/// Trait for task handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The task kind this handler processes.
    fn kind(&self) -> TaskKind;

    /// Execute the task.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    fn can_handle(&self, kind: TaskKind) -> bool {
        self.kind() == kind
    }
}
