use crate::core::probe::GpuProbe;
use crate::core::DeviceId;
use std::time::Duration;

/// High-frequency sampling window used to rank candidates: 30 samples at
/// 100 ms cadence, i.e. a 3 s observation.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub samples: u32,
    pub interval: Duration,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            samples: 30,
            interval: Duration::from_millis(100),
        }
    }
}

/// Ranks candidate devices for a task. `memory_save_mode` biases toward
/// consolidating work onto partially used devices; the inverse mode
/// spreads work off hot devices.
#[derive(Debug, Clone, Copy)]
pub struct GpuSelector {
    pub memory_save_mode: bool,
    pub sampling: SamplingParams,
}

impl GpuSelector {
    pub fn new(memory_save_mode: bool) -> Self {
        Self {
            memory_save_mode,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Pick the best single device out of `candidates` with at least
    /// `required_gb` free right now, or `None` if nothing qualifies.
    pub async fn select_one(
        &self,
        probe: &dyn GpuProbe,
        candidates: &[DeviceId],
        required_gb: u64,
    ) -> Option<DeviceId> {
        // Instantaneous memory filter first; sampling is only worth its
        // 3 s when there is an actual choice to make.
        let mut eligible = Vec::new();
        for &device in candidates {
            match probe.snapshot(device) {
                Ok(snap) if snap.has_free_gb(required_gb) => eligible.push(device),
                Ok(snap) => tracing::debug!(
                    "GPU {device}: insufficient memory ({} MiB free < {required_gb} GiB)",
                    snap.memory_free_mib
                ),
                Err(e) => tracing::debug!("GPU {device}: snapshot failed: {e}"),
            }
        }

        match eligible.len() {
            0 => None,
            1 => Some(eligible[0]),
            _ => self.rank_by_sampling(probe, &eligible).await,
        }
    }

    /// Pick `count` devices by repeated single selection, removing each
    /// winner from the candidate pool. Returns `None` as soon as the pool
    /// cannot cover what is still needed.
    pub async fn select_many(
        &self,
        probe: &dyn GpuProbe,
        candidates: &[DeviceId],
        count: u32,
        required_gb: u64,
    ) -> Option<Vec<DeviceId>> {
        let count = count as usize;
        let mut remaining = candidates.to_vec();
        let mut chosen = Vec::with_capacity(count);

        while chosen.len() < count {
            if remaining.len() < count - chosen.len() {
                return None;
            }
            let winner = self.select_one(probe, &remaining, required_gb).await?;
            remaining.retain(|&d| d != winner);
            chosen.push(winner);
        }
        Some(chosen)
    }

    async fn rank_by_sampling(
        &self,
        probe: &dyn GpuProbe,
        eligible: &[DeviceId],
    ) -> Option<DeviceId> {
        struct Accum {
            device: DeviceId,
            score_sum: f64,
            tie_sum: f64,
            samples: u32,
        }

        let mut accums: Vec<Accum> = eligible
            .iter()
            .map(|&device| Accum {
                device,
                score_sum: 0.0,
                tie_sum: 0.0,
                samples: 0,
            })
            .collect();

        for round in 0..self.sampling.samples {
            for accum in &mut accums {
                let Ok(snap) = probe.snapshot(accum.device) else {
                    continue;
                };
                let utilization = snap.utilization_pct as f64;
                let (score, tie) = if self.memory_save_mode {
                    let free = snap.memory_free_mib as f64;
                    (utilization * free, free)
                } else {
                    let used = snap.memory_used_mib as f64;
                    (utilization * used, used)
                };
                accum.score_sum += score;
                accum.tie_sum += tie;
                accum.samples += 1;
            }
            if round + 1 < self.sampling.samples {
                tokio::time::sleep(self.sampling.interval).await;
            }
        }

        accums
            .into_iter()
            .filter(|a| a.samples > 0)
            .map(|a| {
                let n = a.samples as f64;
                (a.score_sum / n, a.tie_sum / n, a.device)
            })
            .min_by(|(score_a, tie_a, dev_a), (score_b, tie_b, dev_b)| {
                score_a
                    .total_cmp(score_b)
                    .then(tie_a.total_cmp(tie_b))
                    .then(dev_a.cmp(dev_b))
            })
            .map(|(_, _, device)| device)
    }
}
