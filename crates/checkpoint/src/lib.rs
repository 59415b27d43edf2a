//! Checkpoint export for fine-tuned models
//!
//! Writes a single-shard checkpoint in Hugging Face layout: the weights file,
//! `config.json`, tokenizer assets, the weight index and any extra source
//! model files. Replicated models are saved by rank 0 alone; stage-3
//! partitioned models are gathered parameter by parameter across all ranks
//! first.

pub mod assets;
pub mod exporter;
pub mod index;
pub mod tokenizer;
pub mod writer;

pub use assets::{copy_matching_assets, AssetPattern};
pub use exporter::{
    export_checkpoint, save_hf_format, save_zero_three_model, CheckpointExporter, ExportMode,
    ExportSummary,
};
pub use index::{
    get_dtype_size, is_adapter_name, IndexFile, IndexMetadata, WeightIndex, CONFIG_NAME,
    INDEX_NAME, WEIGHTS_NAME,
};
pub use tokenizer::{PretrainedTokenizer, TokenizerAssets};
pub use writer::{decode_state_dict, encode_state_dict, StateDict};
