use crate::core::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    Invalid { from: TaskState, to: TaskState },
    #[error("already in state {0}")]
    AlreadyInState(TaskState),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        // Pending → Running → Completed
        //   ↑         ├────> Retrying ──> Pending
        //   │         ├────> Failed
        //   └─────────┘  (stop returns a running task to Pending)
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Pending)
                | (Retrying, Pending)
        )
    }
}

/// One unit of work: an ordered list of shell commands that all must exit
/// zero, pinned to `gpu_count` devices with `memory_gb` free on each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    pub queue_id: u32,
    /// Shell command lines, `{work_dir}` already substituted.
    pub commands: Vec<String>,
    /// Required free memory on every chosen device, in GiB.
    pub memory_gb: u64,
    /// Devices the task needs at once. Always 1 in single mode.
    pub gpu_count: u32,

    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Devices currently held for this task, empty unless running.
    pub devices: Vec<DeviceId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: u32, queue_id: u32, commands: Vec<String>, memory_gb: u64, gpu_count: u32) -> Self {
        Self {
            id,
            queue_id,
            commands,
            memory_gb,
            gpu_count,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            devices: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition_to(&mut self, next: TaskState) -> Result<(), TransitionError> {
        if self.state == next {
            return Err(TransitionError::AlreadyInState(next));
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }
        match next {
            TaskState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskState::Completed | TaskState::Failed => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn try_transition(&mut self, next: TaskState) -> bool {
        match self.transition_to(next) {
            Ok(()) => {
                tracing::debug!("Task {} (queue {}) -> {}", self.id, self.queue_id, next);
                true
            }
            Err(e) => {
                tracing::error!("Task {} (queue {}): {}", self.id, self.queue_id, e);
                false
            }
        }
    }

    pub fn record_error(&mut self, error: &str) {
        self.last_error = Some(truncate_error(error));
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl QueueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// An ordered queue of tasks, driven serially by one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: u32,
    pub tasks: Vec<Task>,
    pub state: QueueState,
}

impl Queue {
    pub fn new(id: u32, tasks: Vec<Task>) -> Self {
        Self {
            id,
            tasks,
            state: QueueState::Idle,
        }
    }

    /// Derived counters. A task sleeping out a backoff is still work to
    /// do, so `retrying` counts as pending.
    pub fn counters(&self) -> QueueCounters {
        let mut counters = QueueCounters {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.state {
                TaskState::Pending | TaskState::Retrying => counters.pending += 1,
                TaskState::Running => counters.running += 1,
                TaskState::Completed => counters.completed += 1,
                TaskState::Failed => counters.failed += 1,
            }
        }
        counters
    }

    /// Devices held by whichever task is currently running, if any.
    pub fn current_devices(&self) -> Vec<DeviceId> {
        self.tasks
            .iter()
            .find(|t| t.state == TaskState::Running)
            .map(|t| t.devices.clone())
            .unwrap_or_default()
    }

    /// Queue outcome once its worker has stopped driving it: failed if
    /// anything failed, completed if everything completed, otherwise the
    /// state it was left in.
    pub fn settle(&mut self) {
        let counters = self.counters();
        if counters.failed > 0 {
            self.state = QueueState::Failed;
        } else if counters.completed == counters.total {
            self.state = QueueState::Completed;
        }
    }
}

pub(crate) fn truncate_error(error: &str) -> String {
    const MAX: usize = 200;
    if error.len() <= MAX {
        error.to_string()
    } else {
        let mut cut = MAX;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        error[..cut].to_string()
    }
}
