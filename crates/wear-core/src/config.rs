use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wear_gpu::DecoderConfig;
use wear_mem::MemoryConfig;

use crate::CoreError;

pub const DEFAULT_STEPS_PER_TICK: u64 = 1024;
pub const DEFAULT_STACK_RESERVE: u64 = 0x1000;

/// Everything the controller needs to build and drive a machine.
///
/// Unknown JSON fields are rejected; missing ones take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    pub memory: MemoryConfig,
    pub decoder: DecoderConfig,
    /// Sleep between state checks while paused.
    #[serde(rename = "pause_poll_ms", with = "millis")]
    pub pause_poll: Duration,
    /// Steps executed between checks of the controller state. The register snapshot is still
    /// published after every step.
    pub steps_per_tick: u64,
    /// Gap left between `STACK_TOP` and the initial stack pointer.
    pub stack_reserve: u64,
    /// Reported to the guest by `sceKernelIsNeoMode`.
    pub neo_mode: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            decoder: DecoderConfig::default(),
            pause_poll: wear_cpu::DEFAULT_PAUSE_POLL,
            steps_per_tick: DEFAULT_STEPS_PER_TICK,
            stack_reserve: DEFAULT_STACK_RESERVE,
            neo_mode: true,
        }
    }
}

impl EmulatorConfig {
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(CoreError::Config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn to_json_pretty(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
