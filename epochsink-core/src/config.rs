//! Sink selection and knobs. The sink technology is chosen once, at
//! configuration time, either programmatically or from a JSON spec carried
//! in an environment variable.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

const ENV_SINK_SPEC: &str = "EPOCHSINK_SINK_SPEC";

const DEFAULT_STAGING_DIR: &str = "/var/run/epochsink/staging";
const DEFAULT_OUTPUT_DIR: &str = "/var/run/epochsink/output";

/// Mailbox capacity for the writer and coordinator actors.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub sink_type: SinkType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkType {
    File(FileSinkConfig),
    Memory(MemoryConfig),
    Blackhole(BlackholeConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileSinkConfig {
    /// Where writers stage part files before the epoch is decided.
    pub staging_dir: PathBuf,
    /// Where committed part files and epoch markers become visible.
    pub output_dir: PathBuf,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackholeConfig {}

/// Wire shape of the sink spec: exactly one of the variant fields set, e.g.
/// `{"file": {"stagingDir": "...", "outputDir": "..."}}` or `{"memory": {}}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSinkSpec {
    file: Option<FileSinkConfig>,
    memory: Option<MemoryConfig>,
    blackhole: Option<BlackholeConfig>,
}

impl SinkConfig {
    /// Loads the sink spec from the `EPOCHSINK_SINK_SPEC` environment
    /// variable.
    pub fn load() -> Result<Self> {
        let spec = env::var(ENV_SINK_SPEC)
            .map_err(|_| Error::Config(format!("{ENV_SINK_SPEC} is not set")))?;
        spec.parse()
    }
}

impl std::str::FromStr for SinkConfig {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let raw: RawSinkSpec = serde_json::from_str(spec)
            .map_err(|e| Error::Config(format!("failed to parse sink spec: {e}")))?;
        let sink_type = raw
            .file
            .map(SinkType::File)
            .or_else(|| raw.memory.map(SinkType::Memory))
            .or_else(|| raw.blackhole.map(SinkType::Blackhole))
            .ok_or_else(|| Error::Config("Sink type not found".to_string()))?;
        Ok(SinkConfig { sink_type })
    }
}
