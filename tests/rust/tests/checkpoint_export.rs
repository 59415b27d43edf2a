use anyhow::Result;
use checkpoint::{
    decode_state_dict, export_checkpoint, save_zero_three_model, IndexFile, TokenizerAssets,
    INDEX_NAME, WEIGHTS_NAME,
};
use runtime_core::{
    DType, DistributedContext, Error, ExportArgs, LocalProcessGroup, Model, ModelConfig, Module,
    ParamModule, ParamStorage, Parameter, PartitionStatus, ProcessGroup, ShardedTensor, Tensor,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const WORLD_SIZE: usize = 4;

fn embed_full() -> Tensor {
    let values: Vec<f64> = (0..12).map(|v| v as f64).collect();
    Tensor::from_f64(&values, DType::F32, &[4, 3]).unwrap()
}

fn lora_full() -> Tensor {
    Tensor::from_f64(&[0.1; 6], DType::F32, &[2, 3]).unwrap()
}

fn mlp_full() -> Tensor {
    Tensor::from_f64(&[1.0, -1.0, 0.5, 2.0, 8.0], DType::BF16, &[5]).unwrap()
}

fn norm_full() -> Tensor {
    Tensor::from_f64(&[1.0, 1.0, 1.0], DType::F32, &[3]).unwrap()
}

/// Rank `rank`'s view of a stage-3 partitioned model
fn rank_module(rank: usize) -> Result<Arc<ParamModule>> {
    let config = ModelConfig::from_value(json!({
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": 3,
        "vocab_size": 4,
    }))?;

    let module = ParamModule::new(config)
        .with_parameter(
            "model.embed_tokens.weight",
            Parameter::sharded(ShardedTensor::partition(0, &embed_full(), rank, WORLD_SIZE)?),
        )
        .with_parameter(
            "model.layers.0.self_attn.q_proj.lora_A.weight",
            Parameter::sharded(ShardedTensor::partition(1, &lora_full(), rank, WORLD_SIZE)?),
        )
        .with_parameter(
            "model.layers.0.mlp.weight",
            Parameter::sharded(ShardedTensor::partition(2, &mlp_full(), rank, WORLD_SIZE)?),
        )
        .with_parameter("model.norm.weight", Parameter::local(norm_full()))
        .with_buffer(
            "model.rotary_emb.inv_freq",
            Tensor::from_f64(&[1.0, 0.01], DType::F32, &[2])?,
        );
    Ok(Arc::new(module))
}

fn source_model_dir() -> Result<TempDir> {
    let source = TempDir::new()?;
    std::fs::write(source.path().join("tokenizer.json"), b"{\"version\":\"1.0\"}")?;
    std::fs::write(source.path().join("tokenizer_config.json"), b"{}")?;
    std::fs::write(source.path().join("generation_config.json"), b"{\"do_sample\":true}")?;
    std::fs::write(source.path().join("modeling_telechat.py"), b"# model")?;
    std::fs::write(source.path().join("README.md"), b"not copied")?;
    Ok(source)
}

fn rank_output(root: &Path, rank: usize) -> PathBuf {
    root.join(format!("rank-{}", rank))
}

struct RankOutcome {
    rank: usize,
    result: runtime_core::Result<Option<checkpoint::ExportSummary>>,
    all_gather_calls: u64,
    barrier_calls: u64,
    module: Arc<ParamModule>,
}

/// Run a partitioned export on every rank of an in-process group
///
/// Each rank gets its own output directory so writes by other ranks would
/// be visible.
async fn run_partitioned_export(
    out: &Path,
    source: &Path,
    build: fn(usize) -> Result<Arc<ParamModule>>,
) -> Result<Vec<RankOutcome>> {
    let groups = LocalProcessGroup::new_group(WORLD_SIZE)?;
    let mut handles = Vec::new();

    for group in groups {
        let rank = group.rank();
        let module = build(rank)?;
        let args = ExportArgs {
            output_dir: rank_output(out, rank),
            model_name_or_path: source.to_path_buf(),
            global_rank: rank as i64,
            zero_stage: 3,
        };
        let source = source.to_path_buf();

        handles.push(tokio::spawn(async move {
            let ctx = DistributedContext::new(group.clone());
            let model = Model::Wrapped(module.clone());
            let tokenizer = TokenizerAssets::new(&source);
            let result = export_checkpoint(&model, &tokenizer, &args, "final", &ctx).await;
            RankOutcome {
                rank,
                result,
                all_gather_calls: group.stats().all_gather_calls(),
                barrier_calls: group.stats().barrier_calls(),
                module,
            }
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await?);
    }
    Ok(outcomes)
}

#[tokio::test]
async fn test_partitioned_export_across_ranks() -> Result<()> {
    let source = source_model_dir()?;
    let out = TempDir::new()?;

    let outcomes = run_partitioned_export(out.path(), source.path(), rank_module).await?;

    // Every rank joined the same gathers, one per sharded parameter, and
    // waited for rank 0's write at the closing barrier
    for outcome in &outcomes {
        assert_eq!(outcome.all_gather_calls, 3, "rank {}", outcome.rank);
        assert_eq!(outcome.barrier_calls, 1, "rank {}", outcome.rank);
    }

    // Gathered values were released again
    for outcome in &outcomes {
        for (_, param) in outcome.module.named_parameters() {
            if let ParamStorage::Sharded(sharded) = &param.storage {
                assert_eq!(sharded.status(), PartitionStatus::NotAvailable);
            }
        }
    }

    for outcome in &outcomes[1..] {
        assert!(outcome.result.as_ref().unwrap().is_none());
        assert!(!rank_output(out.path(), outcome.rank).exists());
    }

    let summary = outcomes[0].result.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(summary.tensors, 3);
    assert_eq!(
        summary.copied_assets,
        vec!["final/modeling_telechat.py", "final/generation_config.json"]
    );

    let dir = rank_output(out.path(), 0).join("final");
    let state = decode_state_dict(&std::fs::read(dir.join(WEIGHTS_NAME))?)?;
    assert_eq!(state["model.embed_tokens.weight"], embed_full());
    assert_eq!(state["model.layers.0.mlp.weight"], mlp_full());
    assert_eq!(state["model.norm.weight"], norm_full());
    // Stage-3 saves only what the parameter walk gathered
    assert!(!state.contains_key("model.rotary_emb.inv_freq"));
    assert!(!state.keys().any(|k| k.contains("lora")));

    let index = IndexFile::from_json_str(&std::fs::read_to_string(dir.join(INDEX_NAME))?)?;
    assert_eq!(index.metadata.total_size, 12 * 4 + 5 * 2 + 3 * 4);
    assert_eq!(
        index.weight_map.keys().cloned().collect::<Vec<_>>(),
        vec![
            "model.embed_tokens.weight",
            "model.layers.0.mlp.weight",
            "model.norm.weight",
        ]
    );

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("config.json"))?)?;
    assert_eq!(config["hidden_size"], 3);
    assert!(dir.join("tokenizer.json").is_file());
    assert!(!dir.join("README.md").exists());

    Ok(())
}

fn rank_module_with_bad_dtype(rank: usize) -> Result<Arc<ParamModule>> {
    let odd = Tensor::from_bytes(
        DType::Custom("customtype".to_string()),
        &[4],
        vec![0u8; 4].into(),
    )?;
    let full = embed_full();
    let module = ParamModule::new(ModelConfig::default())
        .with_parameter(
            "model.embed_tokens.weight",
            Parameter::sharded(ShardedTensor::partition(0, &full, rank, WORLD_SIZE)?),
        )
        .with_parameter("model.odd", Parameter::local(odd));
    Ok(Arc::new(module))
}

#[tokio::test]
async fn test_unsupported_dtype_fails_every_rank() -> Result<()> {
    let source = source_model_dir()?;
    let out = TempDir::new()?;

    let outcomes =
        run_partitioned_export(out.path(), source.path(), rank_module_with_bad_dtype).await?;

    for outcome in &outcomes {
        assert!(matches!(
            outcome.result,
            Err(Error::UnsupportedDtype { .. })
        ));
        assert_eq!(outcome.all_gather_calls, 0);
        assert_eq!(outcome.barrier_calls, 0);
        assert!(!rank_output(out.path(), outcome.rank).exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_zero_three_helper_single_rank() -> Result<()> {
    let source = source_model_dir()?;
    let out = TempDir::new()?;
    let group = LocalProcessGroup::new_group(1)?.remove(0);
    let ctx = DistributedContext::new(group.clone());

    let full = embed_full();
    let module = ParamModule::new(ModelConfig::default()).with_parameter(
        "model.embed_tokens.weight",
        Parameter::sharded(ShardedTensor::partition(7, &full, 0, 1)?),
    );
    let args = ExportArgs {
        output_dir: out.path().to_path_buf(),
        model_name_or_path: source.path().to_path_buf(),
        global_rank: 0,
        zero_stage: 3,
    };

    let summary = save_zero_three_model(
        &Model::Plain(Arc::new(module)),
        &TokenizerAssets::new(source.path()),
        &args,
        "",
        &ctx,
    )
    .await?
    .expect("rank 0 returns a summary");

    assert_eq!(group.stats().all_gather_calls(), 1);
    assert_eq!(summary.index.metadata.total_size, 48);
    let state = decode_state_dict(&std::fs::read(out.path().join(WEIGHTS_NAME))?)?;
    assert_eq!(state["model.embed_tokens.weight"], full);
    Ok(())
}
