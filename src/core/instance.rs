use crate::config::{ConfigError, SchedulerConfig};
use crate::core::command_file::{parse_command_file, ParseError, TaskSpec};
use crate::core::ledger::DeviceLedger;
use crate::core::probe::{current_username, GpuProbe};
use crate::core::select::{GpuSelector, SamplingParams};
use crate::core::snapshot::{QueueSnapshot, SchedulerSnapshot};
use crate::core::task::{Queue, QueueState, Task};
use crate::core::worker::{
    self, AdmissionBoard, LogRouter, NoLogBindings, SharedQueues, WorkerContext,
    COMMAND_TIMEOUT, KILL_GRACE,
};
use crate::core::{DeviceId, Mode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::{watch, RwLock as AsyncRwLock};

#[derive(Debug, Error)]
pub enum InstanceError {
    /// The vendor query came up empty at start. Fatal.
    #[error("no GPU devices available to schedule on")]
    ProbeUnavailable,
    #[error("failed to read command file {path}: {source}")]
    CommandFileIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed command file: {0}")]
    MalformedCommandFile(#[from] ParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Completed,
    Failed,
    Stopping,
}

impl InstanceState {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }
}

/// Knobs the control plane may tune without touching the scheduler
/// config file; tests shrink the sampling window and timeouts here.
#[derive(Clone)]
pub struct InstanceOptions {
    pub sampling: SamplingParams,
    pub command_timeout: Duration,
    pub kill_grace: Duration,
    pub log_router: Arc<dyn LogRouter>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            command_timeout: COMMAND_TIMEOUT,
            kill_grace: KILL_GRACE,
            log_router: Arc::new(NoLogBindings),
        }
    }
}

/// One live scheduler: a configuration, its chosen devices, the queue
/// map, and one worker per queue. Externally observable only through
/// [`SchedulerInstance::snapshot`].
pub struct SchedulerInstance {
    mode: Mode,
    config_index: u32,
    chosen: Vec<DeviceId>,
    reserved: Vec<DeviceId>,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    ledger: Arc<DeviceLedger>,
    queues: SharedQueues,
    state: RwLock<InstanceState>,
    last_error: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl SchedulerInstance {
    /// Start sequence: validate, probe and size the device pool, parse
    /// the command file, build queues, fan out workers. Any failure here
    /// means the instance never comes up.
    pub fn start(
        mode: Mode,
        config_index: u32,
        config: SchedulerConfig,
        probe: Arc<dyn GpuProbe>,
        options: InstanceOptions,
    ) -> Result<Arc<Self>, InstanceError> {
        config.validate()?;

        let mut probed = if config.use_all_gpus {
            probe.list_devices()
        } else {
            config.compete_gpus.clone()
        };
        probed.sort_unstable();
        probed.dedup();
        if probed.is_empty() {
            return Err(InstanceError::ProbeUnavailable);
        }

        let k = config.chosen_count(probed.len());
        let chosen: Vec<DeviceId> = probed[..k].to_vec();
        let reserved: Vec<DeviceId> = probed[k..].to_vec();
        tracing::info!(
            "Scheduler {mode}/{config_index}: probed {probed:?}, chose {chosen:?}, left {reserved:?} to others"
        );

        let command_path = config.command_file(mode).to_path_buf();
        let content =
            std::fs::read_to_string(&command_path).map_err(|source| {
                InstanceError::CommandFileIo {
                    path: command_path.clone(),
                    source,
                }
            })?;
        let specs = parse_command_file(&content, mode)?;

        let base = command_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let work_dir = config.resolve_work_dir(&base);
        let queue_map = build_queues(specs, mode, &work_dir);
        tracing::info!(
            "Scheduler {mode}/{config_index}: {} queue(s), {} task(s)",
            queue_map.len(),
            queue_map.values().map(|q| q.tasks.len()).sum::<usize>()
        );

        let ledger = Arc::new(DeviceLedger::new());
        let board = Arc::new(AdmissionBoard::new());
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        // Seed the wait board with every queue's head request before any
        // worker runs, so wide multi-GPU tasks get first pick from the
        // idle pool.
        let mut queue_ids = Vec::with_capacity(queue_map.len());
        for queue in queue_map.values() {
            if let Some(head) = queue.tasks.first() {
                board.register(queue.id, head.gpu_count);
            }
            queue_ids.push(queue.id);
        }
        let queues: SharedQueues = Arc::new(AsyncRwLock::new(queue_map));

        let instance = Arc::new(Self {
            mode,
            config_index,
            chosen: chosen.clone(),
            reserved,
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            ledger: ledger.clone(),
            queues: queues.clone(),
            state: RwLock::new(InstanceState::Starting),
            last_error: Mutex::new(None),
            stop_tx: stop_tx.clone(),
            done_tx,
        });

        let my_username = current_username();
        let selector =
            GpuSelector::new(config.memory_save_mode).with_sampling(options.sampling);
        let mut handles = Vec::with_capacity(queue_ids.len());
        for queue_id in queue_ids {
            let ctx = WorkerContext {
                mode,
                config_index,
                queue_id,
                chosen: chosen.clone(),
                check_time: Duration::from_secs(config.check_time),
                maximize_utilization: config.maximize_resource_utilization,
                my_username: my_username.clone(),
                probe: probe.clone(),
                ledger: ledger.clone(),
                selector,
                retry: config.retry_config.clone(),
                queues: queues.clone(),
                board: board.clone(),
                log_router: options.log_router.clone(),
                stop: stop_tx.subscribe(),
                command_timeout: options.command_timeout,
                kill_grace: options.kill_grace,
            };
            handles.push(tokio::spawn(worker::run_queue(ctx)));
        }

        let supervisor = instance.clone();
        tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(
                        "Scheduler {}/{}: worker panicked: {e}",
                        supervisor.mode,
                        supervisor.config_index
                    );
                    supervisor.record_error(&format!("worker panicked: {e}"));
                }
            }
            supervisor.finish().await;
        });

        *instance.state.write().unwrap() = InstanceState::Running;
        Ok(instance)
    }

    /// Cooperative stop: flips the flag every worker suspension point
    /// watches; running children get terminated by their workers.
    pub fn stop(&self) {
        {
            let mut state = self.state.write().unwrap();
            if state.is_live() {
                *state = InstanceState::Stopping;
            }
        }
        tracing::info!("Scheduler {}/{}: stop requested", self.mode, self.config_index);
        let _ = self.stop_tx.send(true);
    }

    /// Resolves once every worker has unwound and the final state is set.
    pub async fn wait(&self) {
        let mut rx = self.done_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    async fn finish(&self) {
        let final_state = {
            let queues = self.queues.read().await;
            if queues.values().any(|q| q.state == QueueState::Failed) {
                InstanceState::Failed
            } else {
                InstanceState::Completed
            }
        };
        *self.state.write().unwrap() = final_state;
        *self.finished_at.lock().unwrap() = Some(Utc::now());
        tracing::info!(
            "Scheduler {}/{}: finished with state {final_state}",
            self.mode,
            self.config_index
        );
        let _ = self.done_tx.send(true);
    }

    fn record_error(&self, error: &str) {
        *self.last_error.lock().unwrap() =
            Some(crate::core::task::truncate_error(error));
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config_index(&self) -> u32 {
        self.config_index
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read().unwrap()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn chosen_devices(&self) -> &[DeviceId] {
        &self.chosen
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let queues = self.queues.read().await;
        let queue_snaps: Vec<QueueSnapshot> =
            queues.values().map(QueueSnapshot::from).collect();
        drop(queues);

        let mut snap = SchedulerSnapshot {
            pid: std::process::id(),
            mode: self.mode,
            config_index: self.config_index,
            state: self.state(),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock().unwrap(),
            chosen_devices: self.chosen.clone(),
            reserved_devices: self.reserved.clone(),
            ledger_held: self.ledger.held_set().into_iter().collect(),
            pending_tasks: 0,
            running_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_tasks: 0,
            queues: queue_snaps,
            last_error: self.last_error.lock().unwrap().clone(),
        };
        snap.fill_totals();
        snap
    }
}

/// Group parsed specs by queue id, preserving in-file order within each
/// queue, with `{work_dir}` substituted into every command.
fn build_queues(specs: Vec<TaskSpec>, mode: Mode, work_dir: &Path) -> BTreeMap<u32, Queue> {
    let work_dir_str = work_dir.display().to_string();
    let mut grouped: BTreeMap<u32, Vec<Task>> = BTreeMap::new();
    for (id, spec) in specs.into_iter().enumerate() {
        let commands = spec
            .commands
            .iter()
            .map(|c| c.replace("{work_dir}", &work_dir_str))
            .collect();
        let gpu_count = match mode {
            Mode::Single => 1,
            Mode::Multi => spec.gpu_count.unwrap_or(1),
        };
        grouped
            .entry(spec.queue_id)
            .or_default()
            .push(Task::new(id as u32, spec.queue_id, commands, spec.memory_gb, gpu_count));
    }
    grouped
        .into_iter()
        .map(|(id, tasks)| (id, Queue::new(id, tasks)))
        .collect()
}
