pub mod command_file;
pub mod instance;
pub mod ledger;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod select;
pub mod snapshot;
pub mod task;
pub mod worker;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stable numeric index of a physical accelerator, as reported by the
/// host's GPU query facility.
pub type DeviceId = u32;

/// Execution mode of a scheduler instance: one device per task, or N
/// devices per task via `CUDA_VISIBLE_DEVICES`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Mode {
    Single,
    Multi,
}

/// Environment variable children read their device assignment from.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
