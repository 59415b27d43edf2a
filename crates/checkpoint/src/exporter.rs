//! Checkpoint export in Hugging Face layout
//!
//! Two modes, picked by `zero_stage`:
//!
//! * replicated: every rank holds the full model, rank 0 writes it
//! * partitioned (stage 3): parameters are sharded across ranks and gathered
//!   one at a time; every rank takes part in the gathers, rank 0 writes

use bytes::Bytes;
use chrono::{DateTime, Utc};
use runtime_core::{
    print_rank_0, DistributedContext, Error, ExportArgs, ExportConfig, GatheredParameters, Model,
    Module, ParamStorage, Result,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, instrument};

use crate::assets::{copy_matching_assets, object_path};
use crate::index::{
    dtype_bits, is_adapter_name, IndexFile, WeightIndex, CONFIG_NAME, INDEX_NAME, WEIGHTS_NAME,
};
use crate::tokenizer::PretrainedTokenizer;
use crate::writer::{encode_state_dict, StateDict};

/// How the exported parameters were held during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    Replicated,
    Partitioned,
}

/// What a completed export wrote
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub output_dir: PathBuf,
    pub mode: ExportMode,
    /// Storage paths written, in write order
    pub files: Vec<String>,
    pub index: IndexFile,
    pub tensors: usize,
    pub bytes_written: u64,
    pub copied_assets: Vec<String>,
    pub exported_at: DateTime<Utc>,
}

fn write_failed(path: &str, e: Error) -> Error {
    Error::CheckpointWriteFailed {
        message: format!("{}: {}", path, e),
    }
}

/// Writes checkpoints into a storage backend
pub struct CheckpointExporter {
    storage: Arc<dyn StorageBackend>,
    assets: ExportConfig,
}

impl CheckpointExporter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            assets: ExportConfig::default(),
        }
    }

    /// Exporter writing under `output_dir` on the local filesystem
    pub fn local<P: AsRef<Path>>(output_dir: P) -> Self {
        Self::new(Arc::new(LocalStorage::new(output_dir)))
    }

    pub fn with_asset_config(mut self, assets: ExportConfig) -> Self {
        self.assets = assets;
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Export in the mode selected by `args.zero_stage`
    ///
    /// Collective when partitioned: every rank must call this with the same
    /// model layout. Returns `None` on ranks other than 0.
    pub async fn export(
        &self,
        model: &Model,
        tokenizer: &dyn PretrainedTokenizer,
        args: &ExportArgs,
        sub_folder: &str,
        ctx: &DistributedContext,
    ) -> Result<Option<ExportSummary>> {
        print_rank_0(
            format!(
                "Exporting checkpoint to {} (zero_stage {})",
                args.output_dir.join(sub_folder).display(),
                args.zero_stage
            ),
            args.global_rank,
        );
        if args.is_partitioned() {
            self.save_partitioned(model, tokenizer, args, sub_folder, ctx)
                .await
        } else {
            self.save_replicated(model, tokenizer, args, sub_folder).await
        }
    }

    /// Rank-0 save of a fully replicated model, including `config.json`
    pub async fn save_replicated(
        &self,
        model: &Model,
        tokenizer: &dyn PretrainedTokenizer,
        args: &ExportArgs,
        sub_folder: &str,
    ) -> Result<Option<ExportSummary>> {
        self.save_local(model, tokenizer, args, sub_folder, true).await
    }

    #[instrument(skip(self, model, tokenizer, args), fields(rank = args.global_rank))]
    async fn save_local(
        &self,
        model: &Model,
        tokenizer: &dyn PretrainedTokenizer,
        args: &ExportArgs,
        sub_folder: &str,
        write_config: bool,
    ) -> Result<Option<ExportSummary>> {
        if !args.is_rank_zero() {
            debug!("Not rank 0, skipping export");
            return Ok(None);
        }

        let module = model.unwrap();
        let mut state = StateDict::new();
        let mut index = WeightIndex::new();

        for (name, param) in module.named_parameters() {
            let ParamStorage::Local(tensor) = &param.storage else {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "parameter {} is partitioned; export it with zero_stage 3",
                        name
                    ),
                });
            };
            if index.add(name, WEIGHTS_NAME, param.numel(), param.dtype())? {
                state.insert(name.to_string(), tensor.cpu());
            }
        }
        collect_buffers(module, &mut state);

        let summary = self
            .write_checkpoint(
                module,
                tokenizer,
                args,
                sub_folder,
                state,
                index,
                write_config,
                ExportMode::Replicated,
            )
            .await?;
        Ok(Some(summary))
    }

    /// Gather-and-save of a stage-3 partitioned model
    ///
    /// Collective: every rank walks the parameters in the same order and
    /// joins each gather. Only rank 0 keeps the gathered values and writes;
    /// the group then meets at a barrier before anyone returns.
    #[instrument(skip(self, model, tokenizer, args, ctx), fields(rank = args.global_rank))]
    pub async fn save_partitioned(
        &self,
        model: &Model,
        tokenizer: &dyn PretrainedTokenizer,
        args: &ExportArgs,
        sub_folder: &str,
        ctx: &DistributedContext,
    ) -> Result<Option<ExportSummary>> {
        let module = model.unwrap();
        let params = module.named_parameters();

        // Every rank fails here, before the first gather, on a bad dtype
        for (name, param) in &params {
            if !is_adapter_name(name) {
                dtype_bits(param.dtype())?;
            }
        }
        if params.iter().any(|(_, p)| p.is_sharded()) {
            ctx.group()?;
        }

        let rank_zero = args.is_rank_zero();
        let mut state = StateDict::new();
        let mut index = WeightIndex::new();

        for (name, param) in &params {
            let _gathered = if param.is_sharded() {
                Some(GatheredParameters::gather(&[*param], ctx.group()?.as_ref(), true).await?)
            } else {
                None
            };

            if rank_zero && index.add(name, WEIGHTS_NAME, param.numel(), param.dtype())? {
                state.insert(name.to_string(), param.data()?.cpu());
            }
        }

        let written = if rank_zero {
            let summary = self
                .write_checkpoint(
                    module,
                    tokenizer,
                    args,
                    sub_folder,
                    state,
                    index,
                    true,
                    ExportMode::Partitioned,
                )
                .await;
            Some(summary)
        } else {
            debug!(parameters = params.len(), "Partitioned export gathers done");
            None
        };

        // No rank returns before rank 0 has finished writing, even on failure
        if let Ok(group) = ctx.group() {
            group.barrier().await?;
        }
        written.transpose()
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_checkpoint(
        &self,
        module: &dyn Module,
        tokenizer: &dyn PretrainedTokenizer,
        args: &ExportArgs,
        sub_folder: &str,
        state: StateDict,
        index: WeightIndex,
        write_config: bool,
        mode: ExportMode,
    ) -> Result<ExportSummary> {
        let dir = sub_folder.trim_matches('/');
        self.storage.create_dir_all(dir).await?;

        let mut files = Vec::new();
        let mut bytes_written = 0u64;
        let tensors = state.len();

        let weights_path = object_path(dir, WEIGHTS_NAME);
        let weights = encode_state_dict(&state)?;
        drop(state);
        bytes_written += self
            .storage
            .write(&weights_path, weights)
            .await
            .map_err(|e| write_failed(&weights_path, e))?;
        files.push(weights_path);

        if write_config {
            let config_path = object_path(dir, CONFIG_NAME);
            let config = module.config().to_json_string()?;
            bytes_written += self
                .storage
                .write(&config_path, Bytes::from(config))
                .await
                .map_err(|e| write_failed(&config_path, e))?;
            files.push(config_path);
        }

        files.extend(tokenizer.save_pretrained(self.storage.as_ref(), dir).await?);

        let index_path = object_path(dir, INDEX_NAME);
        bytes_written += self
            .storage
            .write(&index_path, Bytes::from(index.to_json_string()?))
            .await
            .map_err(|e| write_failed(&index_path, e))?;
        files.push(index_path);

        let copied_assets = copy_matching_assets(
            self.storage.as_ref(),
            &args.model_name_or_path,
            dir,
            &self.assets.copy_patterns,
        )
        .await;

        let summary = ExportSummary {
            output_dir: args.output_dir.join(dir),
            mode,
            files,
            index: index.to_file(),
            tensors,
            bytes_written,
            copied_assets,
            exported_at: Utc::now(),
        };

        info!(
            output_dir = ?summary.output_dir,
            mode = ?summary.mode,
            tensors = summary.tensors,
            total_size = summary.index.metadata.total_size,
            bytes_written = summary.bytes_written,
            "Checkpoint exported"
        );
        Ok(summary)
    }
}

fn collect_buffers(module: &dyn Module, state: &mut StateDict) {
    for (name, buffer) in module.named_buffers() {
        if !is_adapter_name(name) {
            state.insert(name.to_string(), buffer.cpu());
        }
    }
}

/// Rank-0 save of a replicated model into `output_dir[/sub_folder]`
pub async fn save_hf_format(
    model: &Model,
    tokenizer: &dyn PretrainedTokenizer,
    args: &ExportArgs,
    sub_folder: &str,
) -> Result<Option<ExportSummary>> {
    CheckpointExporter::local(&args.output_dir)
        .save_replicated(model, tokenizer, args, sub_folder)
        .await
}

/// Save for models trained with stage-3 partitioning
///
/// With `zero_stage != 3` this is a plain rank-0 save of weights, index and
/// tokenizer, without `config.json`.
pub async fn save_zero_three_model(
    model: &Model,
    tokenizer: &dyn PretrainedTokenizer,
    args: &ExportArgs,
    sub_folder: &str,
    ctx: &DistributedContext,
) -> Result<Option<ExportSummary>> {
    let exporter = CheckpointExporter::local(&args.output_dir);
    if args.is_partitioned() {
        exporter
            .save_partitioned(model, tokenizer, args, sub_folder, ctx)
            .await
    } else {
        exporter
            .save_local(model, tokenizer, args, sub_folder, false)
            .await
    }
}

/// Export in the mode selected by `args.zero_stage`
pub async fn export_checkpoint(
    model: &Model,
    tokenizer: &dyn PretrainedTokenizer,
    args: &ExportArgs,
    sub_folder: &str,
    ctx: &DistributedContext,
) -> Result<Option<ExportSummary>> {
    CheckpointExporter::local(&args.output_dir)
        .export(model, tokenizer, args, sub_folder, ctx)
        .await
}
