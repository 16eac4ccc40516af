use crate::core::retry::RetryPolicy;
use crate::core::{DeviceId, Mode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("check_time must be at least 1 second")]
    CheckTimeZero,
    #[error("retry_config.max_retry_before_backoff must be at least 1")]
    RetryPeriodZero,
    #[error("min_gpu must be at least 1")]
    MinGpuZero,
    #[error("min_gpu ({min_gpu}) must not exceed max_gpu ({max_gpu})")]
    GpuBoundsInverted { min_gpu: u32, max_gpu: u32 },
}

/// Per-scheduler configuration, loaded from one YAML file per
/// config index.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Admit-loop interval in seconds.
    #[serde(default = "default_check_time")]
    pub check_time: u64,
    /// Disables the foreign-process and ledger exclusion checks: every
    /// chosen device is a candidate for every queue.
    #[serde(default)]
    pub maximize_resource_utilization: bool,
    #[serde(default = "default_true")]
    pub memory_save_mode: bool,
    /// Explicit device whitelist, ignored when `use_all_gpus` is set.
    #[serde(default)]
    pub compete_gpus: Vec<DeviceId>,
    #[serde(default = "default_true")]
    pub use_all_gpus: bool,
    /// Devices left to other users of the workstation.
    #[serde(default)]
    pub gpu_left: u32,
    #[serde(default = "default_min_gpu")]
    pub min_gpu: u32,
    #[serde(default = "default_max_gpu")]
    pub max_gpu: u32,
    #[serde(default)]
    pub retry_config: RetryPolicy,
    /// Substituted for `{work_dir}` in command lines. None means the
    /// daemon's current directory.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_gpu_command_file")]
    pub gpu_command_file: PathBuf,
    #[serde(default = "default_gpus_command_file")]
    pub gpus_command_file: PathBuf,
}

fn default_check_time() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_min_gpu() -> u32 {
    1
}

fn default_max_gpu() -> u32 {
    8
}

fn default_gpu_command_file() -> PathBuf {
    PathBuf::from("command/command.txt")
}

fn default_gpus_command_file() -> PathBuf {
    PathBuf::from("command/command_gpus.txt")
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_time: default_check_time(),
            maximize_resource_utilization: false,
            memory_save_mode: true,
            compete_gpus: Vec::new(),
            use_all_gpus: true,
            gpu_left: 0,
            min_gpu: default_min_gpu(),
            max_gpu: default_max_gpu(),
            retry_config: RetryPolicy::default(),
            work_dir: None,
            gpu_command_file: default_gpu_command_file(),
            gpus_command_file: default_gpus_command_file(),
        }
    }
}

impl SchedulerConfig {
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()
    }

    /// The sizing triple and intervals admit a couple of nonsense
    /// combinations; reject them up front rather than mis-scheduling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_time == 0 {
            return Err(ConfigError::CheckTimeZero);
        }
        if self.retry_config.max_retry_before_backoff == 0 {
            return Err(ConfigError::RetryPeriodZero);
        }
        if self.min_gpu == 0 {
            return Err(ConfigError::MinGpuZero);
        }
        if self.min_gpu > self.max_gpu {
            return Err(ConfigError::GpuBoundsInverted {
                min_gpu: self.min_gpu,
                max_gpu: self.max_gpu,
            });
        }
        Ok(())
    }

    /// How many of `probed` devices this scheduler may claim:
    /// `clamp(min(max_gpu, max(min_gpu, probed − gpu_left)), 1, probed)`.
    pub fn chosen_count(&self, probed: usize) -> usize {
        let after_reservation = probed.saturating_sub(self.gpu_left as usize);
        let k = (self.min_gpu as usize)
            .max(after_reservation)
            .min(self.max_gpu as usize);
        k.clamp(1, probed.max(1))
    }

    pub fn command_file(&self, mode: Mode) -> &Path {
        match mode {
            Mode::Single => &self.gpu_command_file,
            Mode::Multi => &self.gpus_command_file,
        }
    }

    /// Resolve `work_dir` against `base` (the config file's directory).
    pub fn resolve_work_dir(&self, base: &Path) -> PathBuf {
        match &self.work_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => std::env::current_dir().unwrap_or_else(|_| base.to_path_buf()),
        }
    }
}

/// Daemon-level settings for the control plane binary.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Scheduler config files; position in this list is the config index.
    #[serde(default)]
    pub scheduler_configs: Vec<PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    59317
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheduler_configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found.");
        }
    }

    if let Ok(default_config_path) = crate::get_config_dir().map(|d| d.join("gpuq.yaml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GPUQ")
                .separator("_")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.check_time, 5);
        assert!(cfg.memory_save_mode);
        assert!(cfg.use_all_gpus);
        assert_eq!(cfg.retry_config.max_retry_before_backoff, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sizing_formula() {
        let cfg = SchedulerConfig {
            gpu_left: 1,
            min_gpu: 2,
            max_gpu: 3,
            ..Default::default()
        };
        // probed 4 → min(3, max(2, 3)) = 3.
        assert_eq!(cfg.chosen_count(4), 3);
        // max_gpu caps a large pool.
        assert_eq!(cfg.chosen_count(10), 3);
        // min_gpu floors a small pool, clamped to what exists.
        assert_eq!(cfg.chosen_count(1), 1);

        let greedy = SchedulerConfig {
            gpu_left: 2,
            min_gpu: 1,
            max_gpu: 8,
            ..Default::default()
        };
        assert_eq!(greedy.chosen_count(2), 1);
        assert_eq!(greedy.chosen_count(8), 6);
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let cfg = SchedulerConfig {
            min_gpu: 5,
            max_gpu: 2,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::GpuBoundsInverted { .. })
        ));
    }

    #[test]
    fn validation_rejects_zero_retry_period() {
        let cfg = SchedulerConfig {
            retry_config: RetryPolicy {
                max_retry_before_backoff: 0,
                backoff_duration: 60,
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::RetryPeriodZero)));
    }

    #[test]
    fn loads_yaml_with_nested_retry_config() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "check_time: 1\n\
             memory_save_mode: true\n\
             use_all_gpus: false\n\
             compete_gpus: [0, 2]\n\
             gpu_left: 1\n\
             min_gpu: 2\n\
             max_gpu: 3\n\
             retry_config:\n\
             \x20 max_retry_before_backoff: 4\n\
             gpus_command_file: command/batch.txt"
        )
        .unwrap();

        let cfg = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.check_time, 1);
        assert!(!cfg.use_all_gpus);
        assert_eq!(cfg.compete_gpus, vec![0, 2]);
        assert_eq!(cfg.retry_config.max_retry_before_backoff, 4);
        // Omitted nested field falls back to its default.
        assert_eq!(cfg.retry_config.backoff_duration, 600);
        assert_eq!(
            cfg.command_file(Mode::Multi),
            Path::new("command/batch.txt")
        );
        assert_eq!(
            cfg.command_file(Mode::Single),
            Path::new("command/command.txt")
        );
    }

    #[test]
    fn work_dir_resolution() {
        let absolute = SchedulerConfig {
            work_dir: Some(PathBuf::from("/data/runs")),
            ..Default::default()
        };
        assert_eq!(
            absolute.resolve_work_dir(Path::new("/etc/gpuq")),
            PathBuf::from("/data/runs")
        );

        let relative = SchedulerConfig {
            work_dir: Some(PathBuf::from("runs")),
            ..Default::default()
        };
        assert_eq!(
            relative.resolve_work_dir(Path::new("/etc/gpuq")),
            PathBuf::from("/etc/gpuq/runs")
        );
    }
}
