use crate::config::SchedulerConfig;
use crate::core::instance::{InstanceError, InstanceOptions, SchedulerInstance};
use crate::core::probe::GpuProbe;
use crate::core::snapshot::SchedulerSnapshot;
use crate::core::Mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// What the registry indexes live schedulers by. At most one live
/// instance may exist per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub mode: Mode,
    pub config_index: u32,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mode, self.config_index)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a scheduler is already running for {0}")]
    Busy(Identity),
    #[error("no live scheduler for {0}")]
    NotFound(Identity),
    #[error(transparent)]
    Start(#[from] InstanceError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReceipt {
    pub identity: Identity,
    pub pid: u32,
}

/// Process-wide table of live scheduler instances. Instances that have
/// reached a terminal state are swept out on every access, the same way
/// stale status files get cleaned up by whoever lists them.
pub struct SchedulerRegistry {
    probe: Arc<dyn GpuProbe>,
    options: InstanceOptions,
    instances: Mutex<HashMap<Identity, Arc<SchedulerInstance>>>,
}

impl SchedulerRegistry {
    pub fn new(probe: Arc<dyn GpuProbe>, options: InstanceOptions) -> Self {
        Self {
            probe,
            options,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Start a scheduler under `identity`. Refused while a live instance
    /// holds the identity, including one that is still stopping.
    pub async fn start(
        &self,
        mode: Mode,
        config_index: u32,
        config: SchedulerConfig,
    ) -> Result<StartReceipt, RegistryError> {
        let identity = Identity { mode, config_index };
        let mut instances = self.instances.lock().await;
        instances.retain(|_, instance| instance.is_live());

        if instances.contains_key(&identity) {
            return Err(RegistryError::Busy(identity));
        }

        let instance = SchedulerInstance::start(
            mode,
            config_index,
            config,
            self.probe.clone(),
            self.options.clone(),
        )?;
        instances.insert(identity, instance);
        tracing::info!("Registry: started scheduler {identity}");
        Ok(StartReceipt {
            identity,
            pid: std::process::id(),
        })
    }

    /// Stop the instance under `identity` and remove it once it has
    /// fully unwound.
    pub async fn stop(&self, mode: Mode, config_index: u32) -> Result<(), RegistryError> {
        let identity = Identity { mode, config_index };
        let instance = {
            let instances = self.instances.lock().await;
            instances
                .get(&identity)
                .filter(|i| i.is_live())
                .cloned()
                .ok_or(RegistryError::NotFound(identity))?
        };

        instance.stop();
        instance.wait().await;
        self.instances.lock().await.remove(&identity);
        tracing::info!("Registry: stopped scheduler {identity}");
        Ok(())
    }

    pub async fn list(&self) -> Vec<SchedulerSnapshot> {
        let mut instances = self.instances.lock().await;
        instances.retain(|_, instance| instance.is_live());
        let live: Vec<Arc<SchedulerInstance>> = instances.values().cloned().collect();
        drop(instances);

        let mut snapshots = Vec::with_capacity(live.len());
        for instance in live {
            snapshots.push(instance.snapshot().await);
        }
        snapshots.sort_by_key(|s| (s.mode == Mode::Multi, s.config_index));
        snapshots
    }

    pub async fn get(&self, mode: Mode, config_index: u32) -> Option<SchedulerSnapshot> {
        let identity = Identity { mode, config_index };
        let instance = {
            let instances = self.instances.lock().await;
            instances.get(&identity).cloned()
        }?;
        Some(instance.snapshot().await)
    }

    /// Stop every live instance and wait for all of them to unwind.
    /// Used by daemon shutdown.
    pub async fn stop_all(&self) {
        let live: Vec<Arc<SchedulerInstance>> = {
            let instances = self.instances.lock().await;
            instances.values().filter(|i| i.is_live()).cloned().collect()
        };
        for instance in &live {
            instance.stop();
        }
        for instance in &live {
            instance.wait().await;
        }
        self.instances.lock().await.clear();
    }
}
