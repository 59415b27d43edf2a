//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Arguments consumed by checkpoint export
    pub export: ExportArgs,

    /// What an export copies besides the weights
    pub export_assets: ExportConfig,

    /// Seed for every random generator; unset means no reproducibility
    pub seed: Option<u64>,

    /// Optimizer grouping settings
    pub optimizer: OptimizerConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl TrainingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.export.zero_stage > 3 {
            return Err(Error::InvalidConfig {
                message: format!("zero_stage must be 0-3, got {}", self.export.zero_stage),
            });
        }
        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "weight_decay must be non-negative, got {}",
                    self.optimizer.weight_decay
                ),
            });
        }
        Ok(())
    }
}

/// Fields of the training arguments that checkpoint export reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportArgs {
    /// Root directory checkpoints are written to
    pub output_dir: PathBuf,

    /// Directory of the pretrained model the run started from
    pub model_name_or_path: PathBuf,

    /// Rank of this process in the whole job
    pub global_rank: i64,

    /// ZeRO stage; 3 means parameters are partitioned across ranks
    pub zero_stage: u8,
}

impl ExportArgs {
    pub fn is_rank_zero(&self) -> bool {
        self.global_rank == 0
    }

    pub fn is_partitioned(&self) -> bool {
        self.zero_stage == 3
    }
}

impl Default for ExportArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            model_name_or_path: PathBuf::from("./model"),
            global_rank: 0,
            zero_stage: 0,
        }
    }
}

/// Extra files carried into an exported checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Shell-style patterns matched against entries of the source model
    /// directory; matches are copied best-effort
    pub copy_patterns: Vec<String>,

    /// Tokenizer asset file names looked up in the source model directory
    pub tokenizer_files: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            copy_patterns: vec!["*telechat*".to_string(), "generation*".to_string()],
            tokenizer_files: [
                "tokenizer_config.json",
                "special_tokens_map.json",
                "tokenizer.json",
                "tokenizer.model",
                "vocab.json",
                "merges.txt",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Optimizer grouping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Weight decay of the decayed group
    pub weight_decay: f64,

    /// Name fragments selecting parameters trained without decay
    pub no_decay_name_list: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            weight_decay: 0.0,
            no_decay_name_list: crate::optim::DEFAULT_NO_DECAY_NAME_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl LoggingConfig {
    /// Install the global tracing subscriber with this filter as fallback
    pub fn init_tracing(&self) {
        crate::telemetry::init_tracing(&self.default_filter);
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "runtime_core=info,checkpoint=info,storage=info".to_string(),
        }
    }
}
