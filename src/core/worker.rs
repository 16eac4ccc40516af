use crate::core::ledger::{AcquireOutcome, DeviceLedger};
use crate::core::probe::GpuProbe;
use crate::core::retry::RetryPolicy;
use crate::core::select::GpuSelector;
use crate::core::task::{Queue, QueueState, Task, TaskState};
use crate::core::{DeviceId, Mode, CUDA_VISIBLE_DEVICES};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};

pub type SharedQueues = Arc<RwLock<BTreeMap<u32, Queue>>>;

/// Wall-clock ceiling for a single spawned command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(7200);

/// How long a terminated child gets to exit before the forceful kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// External log-binding registry contract: maps (mode, config index,
/// queue id, process index) to an absolute log path. The scheduler only
/// consults it, once per task, to route child stdio.
pub trait LogRouter: Send + Sync {
    fn bind(
        &self,
        mode: Mode,
        config_index: u32,
        queue_id: u32,
        process_index: usize,
    ) -> Option<PathBuf>;
}

/// Default router: no bindings, children share the scheduler's stdio.
pub struct NoLogBindings;

impl LogRouter for NoLogBindings {
    fn bind(&self, _: Mode, _: u32, _: u32, _: usize) -> Option<PathBuf> {
        None
    }
}

/// Wait board for sibling queues of one instance. A queue defers its
/// admission round while a sibling waits on a strictly larger device
/// request that the currently free pool could satisfy, so wide multi-GPU
/// tasks are not starved by narrow ones (and an unsatisfiable wide
/// request never blocks the narrow ones).
#[derive(Debug, Default)]
pub struct AdmissionBoard {
    waiting: Mutex<HashMap<u32, u32>>,
}

impl AdmissionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue_id: u32, gpu_count: u32) {
        self.waiting.lock().unwrap().insert(queue_id, gpu_count);
    }

    pub fn deregister(&self, queue_id: u32) {
        self.waiting.lock().unwrap().remove(&queue_id);
    }

    pub fn must_yield(&self, queue_id: u32, gpu_count: u32, free_devices: usize) -> bool {
        self.waiting
            .lock()
            .unwrap()
            .iter()
            .any(|(&other, &count)| {
                other != queue_id && count > gpu_count && count as usize <= free_devices
            })
    }
}

/// Everything one queue worker needs. Built by the scheduler instance,
/// one per queue.
pub(crate) struct WorkerContext {
    pub mode: Mode,
    pub config_index: u32,
    pub queue_id: u32,
    pub chosen: Vec<DeviceId>,
    pub check_time: Duration,
    pub maximize_utilization: bool,
    pub my_username: String,
    pub probe: Arc<dyn GpuProbe>,
    pub ledger: Arc<DeviceLedger>,
    pub selector: GpuSelector,
    pub retry: RetryPolicy,
    pub queues: SharedQueues,
    pub board: Arc<AdmissionBoard>,
    pub log_router: Arc<dyn LogRouter>,
    pub stop: watch::Receiver<bool>,
    pub command_timeout: Duration,
    pub kill_grace: Duration,
}

enum ExecResult {
    Success,
    Failed { error: String },
    Stopped,
}

enum ChildOutcome {
    Exited(std::process::ExitStatus),
    WaitError(String),
    TimedOut,
    Stopped,
}

/// Drive one queue's tasks strictly in order: admit devices, run the
/// task's commands, classify, retry until completed or stopped.
pub(crate) async fn run_queue(mut ctx: WorkerContext) {
    let task_count = {
        let queues = ctx.queues.read().await;
        queues.get(&ctx.queue_id).map(|q| q.tasks.len()).unwrap_or(0)
    };
    tracing::info!("Queue {}: worker started with {} task(s)", ctx.queue_id, task_count);

    'tasks: for index in 0..task_count {
        if stop_requested(&ctx.stop) {
            break;
        }

        let Some((commands, memory_gb, gpu_count, state)) = read_task(&ctx, index).await else {
            break;
        };
        if state == TaskState::Completed {
            continue;
        }

        // Stdio routing is decided once per task.
        let log_path = ctx
            .log_router
            .bind(ctx.mode, ctx.config_index, ctx.queue_id, index);

        loop {
            let Some(devices) = admit(&mut ctx, memory_gb, gpu_count).await else {
                // Stop arrived while waiting; the task stays pending.
                break 'tasks;
            };

            mark_running(&ctx, index, &devices).await;
            let result = execute(&mut ctx, &commands, &devices, log_path.as_deref()).await;
            for &device in &devices {
                ctx.ledger.release(device, ctx.queue_id);
            }

            match result {
                ExecResult::Success => {
                    with_task(&ctx, index, |task| {
                        task.devices.clear();
                        task.try_transition(TaskState::Completed);
                    })
                    .await;
                    tracing::info!(
                        "Queue {}: task {}/{} completed",
                        ctx.queue_id,
                        index + 1,
                        task_count
                    );
                    break;
                }
                ExecResult::Stopped => {
                    with_task(&ctx, index, |task| {
                        task.devices.clear();
                        task.try_transition(TaskState::Pending);
                    })
                    .await;
                    break 'tasks;
                }
                ExecResult::Failed { error } => {
                    let retry_count = with_task(&ctx, index, |task| {
                        task.devices.clear();
                        task.retry_count += 1;
                        task.record_error(&error);
                        task.try_transition(TaskState::Retrying);
                        task.retry_count
                    })
                    .await
                    .unwrap_or(0);

                    if let Some(backoff) = ctx.retry.should_backoff(retry_count) {
                        tracing::warn!(
                            "Queue {}: task {}/{} failed (retry #{retry_count}, {error}), backing off {}s",
                            ctx.queue_id,
                            index + 1,
                            task_count,
                            backoff.as_secs()
                        );
                        let interrupted = !sleep_unless_stopped(&mut ctx.stop, backoff).await;
                        with_task(&ctx, index, |task| {
                            task.try_transition(TaskState::Pending);
                        })
                        .await;
                        if interrupted {
                            break 'tasks;
                        }
                    } else {
                        tracing::warn!(
                            "Queue {}: task {}/{} failed (retry #{retry_count}, {error}), will retry",
                            ctx.queue_id,
                            index + 1,
                            task_count
                        );
                        with_task(&ctx, index, |task| {
                            task.try_transition(TaskState::Pending);
                        })
                        .await;
                    }
                }
            }
        }
    }

    ctx.board.deregister(ctx.queue_id);
    let mut queues = ctx.queues.write().await;
    if let Some(queue) = queues.get_mut(&ctx.queue_id) {
        queue.settle();
        tracing::info!("Queue {}: worker finished, state {}", ctx.queue_id, queue.state);
    }
}

/// Wait until `gpu_count` admissible devices are acquired from the
/// ledger, or the stop flag is raised (`None`).
async fn admit(
    ctx: &mut WorkerContext,
    memory_gb: u64,
    gpu_count: u32,
) -> Option<Vec<DeviceId>> {
    ctx.board.register(ctx.queue_id, gpu_count);
    let result = admit_loop(ctx, memory_gb, gpu_count).await;
    ctx.board.deregister(ctx.queue_id);
    result
}

async fn admit_loop(
    ctx: &mut WorkerContext,
    memory_gb: u64,
    gpu_count: u32,
) -> Option<Vec<DeviceId>> {
    loop {
        if stop_requested(&ctx.stop) {
            return None;
        }

        // Devices free of sibling queues, unless the config says to
        // pile on regardless.
        let internal: Vec<DeviceId> = if ctx.maximize_utilization {
            ctx.chosen.clone()
        } else {
            let held = ctx.ledger.held_set();
            ctx.chosen
                .iter()
                .copied()
                .filter(|d| !held.contains_key(d))
                .collect()
        };

        if ctx
            .board
            .must_yield(ctx.queue_id, gpu_count, internal.len())
        {
            tracing::debug!(
                "Queue {}: yielding to a wider sibling request",
                ctx.queue_id
            );
            sleep_unless_stopped(&mut ctx.stop, ctx.check_time).await;
            continue;
        }

        let mut survivors = Vec::new();
        for &device in &internal {
            let snap = match ctx.probe.snapshot(device) {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::debug!("GPU {device}: probe failed during admit: {e}");
                    continue;
                }
            };
            if !snap.has_free_gb(memory_gb) {
                continue;
            }
            if !ctx.maximize_utilization {
                match ctx
                    .probe
                    .foreign_python_processes(device, &ctx.my_username)
                {
                    Ok(pids) if !pids.is_empty() => {
                        tracing::debug!("GPU {device}: foreign workloads {pids:?}");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!("GPU {device}: process query failed: {e}");
                        continue;
                    }
                    Ok(_) => {}
                }
            }
            survivors.push(device);
        }

        if let Some(devices) = ctx
            .selector
            .select_many(ctx.probe.as_ref(), &survivors, gpu_count, memory_gb)
            .await
        {
            let mut taken = Vec::new();
            let mut raced = false;
            for &device in &devices {
                match ctx.ledger.acquire(device, ctx.queue_id) {
                    AcquireOutcome::Ok => taken.push(device),
                    AcquireOutcome::Busy(owner) => {
                        tracing::debug!(
                            "GPU {device}: lost acquire race to queue {owner}"
                        );
                        raced = true;
                        break;
                    }
                }
            }
            if raced {
                for &device in &taken {
                    ctx.ledger.release(device, ctx.queue_id);
                }
                continue;
            }
            tracing::info!("Queue {}: acquired GPUs {devices:?}", ctx.queue_id);
            return Some(devices);
        }

        sleep_unless_stopped(&mut ctx.stop, ctx.check_time).await;
    }
}

/// Run every command of the task in order through a shell, each pinned
/// to `devices` via the visibility variable.
async fn execute(
    ctx: &mut WorkerContext,
    commands: &[String],
    devices: &[DeviceId],
    log_path: Option<&Path>,
) -> ExecResult {
    let visible = devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",");

    for (step, command) in commands.iter().enumerate() {
        if stop_requested(&ctx.stop) {
            return ExecResult::Stopped;
        }
        tracing::info!(
            "Queue {}: [{}/{}] [GPUs {visible}] {command}",
            ctx.queue_id,
            step + 1,
            commands.len()
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env(CUDA_VISIBLE_DEVICES, &visible)
            .stdin(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(path) = log_path {
            match open_log(path) {
                Ok((out, err)) => {
                    cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
                }
                Err(e) => {
                    return ExecResult::Failed {
                        error: format!("cannot open log {}: {e}", path.display()),
                    };
                }
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecResult::Failed {
                    error: format!("spawn failed: {e}"),
                };
            }
        };

        match wait_child(ctx, &mut child).await {
            ChildOutcome::Exited(status) if status.success() => {}
            ChildOutcome::Exited(status) => {
                let error = match status.code() {
                    Some(code) => format!("exit_code_{code}"),
                    None => "killed_by_signal".to_string(),
                };
                return ExecResult::Failed { error };
            }
            ChildOutcome::WaitError(e) => {
                return ExecResult::Failed {
                    error: format!("wait failed: {e}"),
                };
            }
            ChildOutcome::TimedOut => {
                return ExecResult::Failed {
                    error: format!("timeout_after_{}s", ctx.command_timeout.as_secs()),
                };
            }
            ChildOutcome::Stopped => return ExecResult::Stopped,
        }
    }

    ExecResult::Success
}

fn open_log(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let clone = file.try_clone()?;
    Ok((file, clone))
}

async fn wait_child(ctx: &mut WorkerContext, child: &mut Child) -> ChildOutcome {
    let timeout = tokio::time::sleep(ctx.command_timeout);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => ChildOutcome::Exited(status),
                    Err(e) => ChildOutcome::WaitError(e.to_string()),
                };
            }
            _ = &mut timeout => {
                tracing::error!(
                    "Queue {}: command exceeded {}s, terminating",
                    ctx.queue_id,
                    ctx.command_timeout.as_secs()
                );
                terminate(child, ctx.kill_grace).await;
                return ChildOutcome::TimedOut;
            }
            changed = ctx.stop.changed() => {
                if changed.is_err() || *ctx.stop.borrow() {
                    terminate(child, ctx.kill_grace).await;
                    return ChildOutcome::Stopped;
                }
            }
        }
    }
}

/// Graceful terminate, forceful kill after the grace period. The child
/// leads its own process group, so the signal reaches the whole tree.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(format!("-{pid}"))
                .status();
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        #[cfg(unix)]
        {
            let _ = std::process::Command::new("kill")
                .arg("-KILL")
                .arg(format!("-{pid}"))
                .status();
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `duration`, waking early on stop. Returns false if the stop
/// flag interrupted the sleep.
async fn sleep_unless_stopped(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *stop.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return false;
                }
            }
        }
    }
}

async fn read_task(
    ctx: &WorkerContext,
    index: usize,
) -> Option<(Vec<String>, u64, u32, TaskState)> {
    let queues = ctx.queues.read().await;
    let task = queues.get(&ctx.queue_id)?.tasks.get(index)?;
    Some((
        task.commands.clone(),
        task.memory_gb,
        task.gpu_count,
        task.state,
    ))
}

async fn mark_running(ctx: &WorkerContext, index: usize, devices: &[DeviceId]) {
    let mut queues = ctx.queues.write().await;
    let Some(queue) = queues.get_mut(&ctx.queue_id) else {
        return;
    };
    if queue.state == QueueState::Idle {
        queue.state = QueueState::Running;
    }
    if let Some(task) = queue.tasks.get_mut(index) {
        task.devices = devices.to_vec();
        task.try_transition(TaskState::Running);
    }
}

async fn with_task<R>(
    ctx: &WorkerContext,
    index: usize,
    apply: impl FnOnce(&mut Task) -> R,
) -> Option<R> {
    let mut queues = ctx.queues.write().await;
    let queue = queues.get_mut(&ctx.queue_id)?;
    queue.tasks.get_mut(index).map(apply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::mock::MockProbe;
    use crate::core::select::SamplingParams;
    use std::collections::BTreeMap;

    async fn test_context(
        queue_id: u32,
        tasks: Vec<Task>,
        probe: Arc<MockProbe>,
        chosen: Vec<DeviceId>,
        ledger: Arc<DeviceLedger>,
        queues: SharedQueues,
        stop: watch::Receiver<bool>,
    ) -> WorkerContext {
        queues
            .write()
            .await
            .insert(queue_id, Queue::new(queue_id, tasks));
        WorkerContext {
            mode: Mode::Single,
            config_index: 0,
            queue_id,
            chosen,
            check_time: Duration::from_millis(50),
            maximize_utilization: false,
            my_username: "tester".into(),
            probe,
            ledger,
            selector: GpuSelector::new(true).with_sampling(SamplingParams {
                samples: 1,
                interval: Duration::ZERO,
            }),
            retry: RetryPolicy {
                max_retry_before_backoff: 3,
                backoff_duration: 1,
            },
            queues,
            board: Arc::new(AdmissionBoard::new()),
            log_router: Arc::new(NoLogBindings),
            stop,
            command_timeout: COMMAND_TIMEOUT,
            kill_grace: Duration::from_secs(1),
        }
    }

    fn shared_queues() -> SharedQueues {
        Arc::new(RwLock::new(BTreeMap::new()))
    }

    fn task(id: u32, queue_id: u32, command: &str) -> Task {
        Task::new(id, queue_id, vec![command.to_string()], 20, 1)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tasks_run_serially_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("order.txt");
        let probe = Arc::new(MockProbe::new(&[0]));
        let queues = shared_queues();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let tasks = vec![
            task(0, 1, &format!("echo one >> {}", marker.display())),
            task(1, 1, &format!("echo two >> {}", marker.display())),
        ];
        let ctx = test_context(
            1,
            tasks,
            probe,
            vec![0],
            Arc::new(DeviceLedger::new()),
            queues.clone(),
            stop_rx,
        )
        .await;
        run_queue(ctx).await;

        let queues = queues.read().await;
        let queue = queues.get(&1).unwrap();
        assert_eq!(queue.state, QueueState::Completed);
        assert!(queue.tasks.iter().all(|t| t.state == TaskState::Completed));
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "one\ntwo\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_workload_keeps_device_out() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("device.txt");
        let probe = Arc::new(MockProbe::new(&[0, 1]));
        probe.set_foreign(0, vec![9999]);
        let queues = shared_queues();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let ctx = test_context(
            1,
            vec![task(
                0,
                1,
                &format!("echo $CUDA_VISIBLE_DEVICES >> {}", marker.display()),
            )],
            probe,
            vec![0, 1],
            Arc::new(DeviceLedger::new()),
            queues.clone(),
            stop_rx,
        )
        .await;
        run_queue(ctx).await;

        let queues = queues.read().await;
        let done = &queues.get(&1).unwrap().tasks[0];
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_task_retries_and_backs_off() {
        let probe = Arc::new(MockProbe::new(&[0]));
        let queues = shared_queues();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut ctx = test_context(
            1,
            vec![task(0, 1, "exit 1")],
            probe,
            vec![0],
            Arc::new(DeviceLedger::new()),
            queues.clone(),
            stop_rx,
        )
        .await;
        ctx.retry = RetryPolicy {
            max_retry_before_backoff: 3,
            backoff_duration: 60,
        };

        let handle = tokio::spawn(run_queue(ctx));
        // Three fast attempts, then the worker parks in the 60 s backoff.
        tokio::time::sleep(Duration::from_secs(3)).await;
        {
            let queues = queues.read().await;
            let t = &queues.get(&1).unwrap().tasks[0];
            assert_eq!(t.retry_count, 3);
            assert!(matches!(
                t.state,
                TaskState::Pending | TaskState::Running | TaskState::Retrying
            ));
            assert_eq!(t.last_error.as_deref(), Some("exit_code_1"));
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let queues = queues.read().await;
        let t = &queues.get(&1).unwrap().tasks[0];
        assert_ne!(t.state, TaskState::Completed);
        assert_ne!(t.state, TaskState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_running_child_and_leaves_task_pending() {
        let probe = Arc::new(MockProbe::new(&[0]));
        let queues = shared_queues();
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = test_context(
            1,
            vec![task(0, 1, "sleep 600")],
            probe,
            vec![0],
            Arc::new(DeviceLedger::new()),
            queues.clone(),
            stop_rx,
        )
        .await;
        let handle = tokio::spawn(run_queue(ctx));
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop_tx.send(true).unwrap();

        // Worker must unwind well within the grace period + margin.
        tokio::time::timeout(Duration::from_secs(8), handle)
            .await
            .expect("worker did not stop in time")
            .unwrap();

        let queues = queues.read().await;
        let t = &queues.get(&1).unwrap().tasks[0];
        assert_eq!(t.state, TaskState::Pending);
        assert!(t.devices.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_queues_share_one_device_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("overlap.txt");
        let probe = Arc::new(MockProbe::new(&[0]));
        let queues = shared_queues();
        let ledger = Arc::new(DeviceLedger::new());
        let board = Arc::new(AdmissionBoard::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Each task notes start/end; exclusive device use means no
        // interleaving of the two windows.
        let script = |tag: &str| {
            format!(
                "echo start-{tag} >> {m} && sleep 0.3 && echo end-{tag} >> {m}",
                m = marker.display()
            )
        };

        let mut ctx1 = test_context(
            1,
            vec![task(0, 1, &script("a"))],
            probe.clone(),
            vec![0],
            ledger.clone(),
            queues.clone(),
            stop_rx.clone(),
        )
        .await;
        ctx1.board = board.clone();
        let mut ctx2 = test_context(
            2,
            vec![task(0, 2, &script("b"))],
            probe,
            vec![0],
            ledger,
            queues.clone(),
            stop_rx,
        )
        .await;
        ctx2.board = board;

        let (r1, r2) = tokio::join!(run_queue(ctx1), run_queue(ctx2));
        let _ = (r1, r2);

        let lines: Vec<String> = std::fs::read_to_string(&marker)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 4);
        // Whichever ran first must have ended before the other started.
        assert!(lines[0].starts_with("start-"));
        assert_eq!(
            lines[1],
            lines[0].replace("start", "end"),
            "device was shared: {lines:?}"
        );
    }

    #[test]
    fn board_yields_only_to_satisfiable_wider_requests() {
        let board = AdmissionBoard::new();
        board.register(1, 1);
        board.register(2, 3);
        board.register(3, 2);

        // Four devices free: everyone defers to queue 2's request of 3.
        assert!(board.must_yield(1, 1, 4));
        assert!(board.must_yield(3, 2, 4));
        assert!(!board.must_yield(2, 3, 4));

        // One device free: queue 2's request cannot fit, nobody defers
        // to it, and queue 1's single-device request proceeds.
        assert!(!board.must_yield(1, 1, 1));
        assert!(!board.must_yield(3, 2, 1));

        board.deregister(2);
        // Queue 3's request of 2 is now the widest.
        assert!(board.must_yield(1, 1, 2));
        assert!(!board.must_yield(1, 1, 1));
    }
}
