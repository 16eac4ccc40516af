use crate::core::instance::InstanceState;
use crate::core::task::{Queue, QueueCounters, QueueState, Task, TaskState};
use crate::core::{DeviceId, Mode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable observation of one scheduler instance, the only externally
/// visible state it has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub pid: u32,
    pub mode: Mode,
    pub config_index: u32,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub chosen_devices: Vec<DeviceId>,
    /// Probed but not chosen, left to other users. Informational only.
    pub reserved_devices: Vec<DeviceId>,
    pub ledger_held: BTreeMap<DeviceId, u32>,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_tasks: usize,
    pub queues: Vec<QueueSnapshot>,
    pub last_error: Option<String>,
}

impl SchedulerSnapshot {
    /// Aggregate counters are always the sum of the per-queue counters at
    /// the moment of observation.
    pub(crate) fn fill_totals(&mut self) {
        let mut totals = QueueCounters::default();
        for queue in &self.queues {
            totals.pending += queue.counters.pending;
            totals.running += queue.counters.running;
            totals.completed += queue.counters.completed;
            totals.failed += queue.counters.failed;
            totals.total += queue.counters.total;
        }
        self.pending_tasks = totals.pending;
        self.running_tasks = totals.running;
        self.completed_tasks = totals.completed;
        self.failed_tasks = totals.failed;
        self.total_tasks = totals.total;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub id: u32,
    pub state: QueueState,
    #[serde(flatten)]
    pub counters: QueueCounters,
    /// Short human-readable description of the task currently running.
    pub current_task: Option<String>,
    pub current_devices: Vec<DeviceId>,
    pub processes: Vec<ProcessSnapshot>,
}

impl From<&Queue> for QueueSnapshot {
    fn from(queue: &Queue) -> Self {
        let current_task = queue
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Running)
            .map(|idx| {
                let command = queue.tasks[idx]
                    .commands
                    .first()
                    .map(|c| c.chars().take(50).collect::<String>())
                    .unwrap_or_default();
                format!("task {}/{}: {command}", idx + 1, queue.tasks.len())
            });

        Self {
            id: queue.id,
            state: queue.state,
            counters: queue.counters(),
            current_task,
            current_devices: queue.current_devices(),
            processes: queue.tasks.iter().enumerate().map(ProcessSnapshot::from).collect(),
        }
    }
}

/// Per-task detail inside a queue snapshot. `index` is the task's
/// position within its queue, which is also its log-binding key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub index: usize,
    pub state: TaskState,
    pub memory_gb: u64,
    pub gpu_count: u32,
    pub devices: Vec<DeviceId>,
    pub retry_count: u32,
    pub commands: Vec<String>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<(usize, &Task)> for ProcessSnapshot {
    fn from((index, task): (usize, &Task)) -> Self {
        Self {
            index,
            state: task.state,
            memory_gb: task.memory_gb,
            gpu_count: task.gpu_count,
            devices: task.devices.clone(),
            retry_count: task.retry_count,
            commands: task.commands.clone(),
            last_error: task.last_error.clone(),
            started_at: task.started_at,
            finished_at: task.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    fn queue(id: u32, states: &[TaskState]) -> Queue {
        let tasks = states
            .iter()
            .enumerate()
            .map(|(i, &state)| {
                let mut t = Task::new(i as u32, id, vec![format!("echo {i}")], 8, 1);
                t.state = state;
                t
            })
            .collect();
        Queue::new(id, tasks)
    }

    #[test]
    fn totals_are_sum_of_queue_counters() {
        use TaskState::*;
        let queues = vec![
            QueueSnapshot::from(&queue(1, &[Completed, Running, Pending])),
            QueueSnapshot::from(&queue(2, &[Completed, Retrying])),
        ];
        let mut snap = SchedulerSnapshot {
            pid: 1,
            mode: Mode::Single,
            config_index: 0,
            state: InstanceState::Running,
            started_at: Utc::now(),
            finished_at: None,
            chosen_devices: vec![0, 1],
            reserved_devices: vec![],
            ledger_held: BTreeMap::new(),
            pending_tasks: 0,
            running_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_tasks: 0,
            queues,
            last_error: None,
        };
        snap.fill_totals();
        assert_eq!(snap.total_tasks, 5);
        assert_eq!(snap.completed_tasks, 2);
        assert_eq!(snap.running_tasks, 1);
        // Retrying counts with pending.
        assert_eq!(snap.pending_tasks, 2);
        assert_eq!(snap.failed_tasks, 0);
    }

    #[test]
    fn current_task_summary_points_at_running_task() {
        use TaskState::*;
        let q = queue(1, &[Completed, Running, Pending]);
        let snap = QueueSnapshot::from(&q);
        assert_eq!(snap.current_task.as_deref(), Some("task 2/3: echo 1"));
        assert_eq!(snap.processes.len(), 3);
        assert_eq!(snap.processes[1].index, 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let q = queue(3, &[TaskState::Pending]);
        let json = serde_json::to_string(&QueueSnapshot::from(&q)).unwrap();
        assert!(json.contains("\"pending\":1"));
        assert!(json.contains("\"id\":3"));
    }
}
