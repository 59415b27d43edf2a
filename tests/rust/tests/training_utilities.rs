use anyhow::Result;
use checkpoint::{CheckpointExporter, TokenizerAssets};
use rand::RngCore;
use runtime_core::{
    get_all_reduce_mean, get_optimizer_grouped_parameters, to_device, Batch, BatchValue, DType,
    Device, DistributedContext, LocalProcessGroup, Model, ModelConfig, ParamModule, Parameter,
    ProcessGroup, RngRegistry, Tensor, TrainingConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "export": {
        "output_dir": "/tmp/finetune-out",
        "model_name_or_path": "/models/base",
        "global_rank": 0,
        "zero_stage": 3
    },
    "seed": 1234,
    "optimizer": {
        "weight_decay": 0.1
    }
}"#;

#[test]
fn test_config_drives_seed_and_grouping() -> Result<()> {
    let config = TrainingConfig::from_json_str(CONFIG)?;
    config.validate()?;
    assert!(config.export.is_partitioned());

    let mut first = RngRegistry::new(2);
    let mut second = RngRegistry::new(2);
    first.set_random_seed(config.seed);
    second.set_random_seed(config.seed);
    assert_eq!(first.general().next_u64(), second.general().next_u64());
    assert_eq!(
        first.device(1).map(|r| r.next_u64()),
        second.device(1).map(|r| r.next_u64())
    );

    let weight = || Tensor::zeros(DType::F32, &[2, 2]);
    let module = ParamModule::new(ModelConfig::default())
        .with_parameter("encoder.layer.0.dense.weight", Parameter::local(weight()?))
        .with_parameter("encoder.layer.0.dense.bias", Parameter::local(weight()?))
        .with_parameter("encoder.layer.0.LayerNorm.weight", Parameter::local(weight()?))
        .with_parameter(
            "embeddings.word_embeddings.weight",
            Parameter::local(weight()?).frozen(),
        );

    let [decay, no_decay] = get_optimizer_grouped_parameters(
        &module,
        config.optimizer.weight_decay,
        &config.optimizer.no_decay_name_list,
    );
    assert_eq!(decay.names(), vec!["encoder.layer.0.dense.weight"]);
    assert_eq!(decay.weight_decay, 0.1);
    assert_eq!(
        no_decay.names(),
        vec!["encoder.layer.0.dense.bias", "encoder.layer.0.LayerNorm.weight"]
    );
    assert_eq!(no_decay.weight_decay, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_config_drives_export_assets() -> Result<()> {
    let source = TempDir::new()?;
    let out = TempDir::new()?;
    std::fs::write(source.path().join("spiece.model"), b"sp")?;
    std::fs::write(source.path().join("tokenizer.json"), b"{}")?;
    std::fs::write(source.path().join("modeling_qwen.py"), b"# qwen")?;
    std::fs::write(source.path().join("generation_config.json"), b"{}")?;

    let mut config = TrainingConfig::from_json_str(
        r#"{
            "export": {"global_rank": 0, "zero_stage": 0},
            "export_assets": {
                "copy_patterns": ["modeling_*.py"],
                "tokenizer_files": ["spiece.model"]
            },
            "logging": {"default_filter": "checkpoint=debug"}
        }"#,
    )?;
    config.logging.init_tracing();
    config.export.output_dir = out.path().to_path_buf();
    config.export.model_name_or_path = source.path().to_path_buf();

    let module = ParamModule::new(ModelConfig::default())
        .with_parameter("lm_head.weight", Parameter::local(Tensor::zeros(DType::F32, &[2])?));
    let tokenizer =
        TokenizerAssets::from_config(&config.export.model_name_or_path, &config.export_assets);
    let summary = CheckpointExporter::local(&config.export.output_dir)
        .with_asset_config(config.export_assets.clone())
        .export(
            &Model::Plain(Arc::new(module)),
            &tokenizer,
            &config.export,
            "",
            &DistributedContext::uninitialized(),
        )
        .await?
        .expect("rank 0 returns a summary");

    assert!(summary.files.iter().any(|f| f == "spiece.model"));
    assert!(!out.path().join("tokenizer.json").exists());
    assert_eq!(summary.copied_assets, vec!["modeling_qwen.py"]);
    assert!(!out.path().join("generation_config.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_batch_move_then_mean_loss() -> Result<()> {
    let groups = LocalProcessGroup::new_group(2)?;
    let mut handles = Vec::new();

    for group in groups {
        handles.push(tokio::spawn(async move {
            let rank = group.rank();
            let mut batch = Batch::new();
            batch.insert(
                "input_ids".to_string(),
                BatchValue::from(Tensor::from_slice(&[1i64, 2, 3], &[1, 3])?),
            );
            batch.insert("sample_id".to_string(), BatchValue::Text(format!("s{}", rank)));

            let device = Device::Cuda(rank);
            let moved = to_device(&batch, device);
            assert_eq!(moved.len(), batch.len());
            assert_eq!(
                moved["input_ids"].as_tensor().map(|t| t.device()),
                Some(device)
            );
            assert_eq!(moved["sample_id"], batch["sample_id"]);

            let loss = Tensor::from_f64(&[rank as f64 + 1.0], DType::F32, &[1])?.to(device);
            let ctx = DistributedContext::new(group);
            let mean = get_all_reduce_mean(&ctx, &loss).await?;
            anyhow::Ok((mean.device(), mean.to_f64_vec()?))
        }));
    }

    for (rank, handle) in handles.into_iter().enumerate() {
        let (device, values) = handle.await??;
        assert_eq!(device, Device::Cuda(rank));
        assert_eq!(values, vec![1.5]);
    }
    Ok(())
}

#[tokio::test]
async fn test_mean_requires_distributed_context() {
    let loss = Tensor::from_f64(&[2.0], DType::F32, &[1]).unwrap();
    let err = get_all_reduce_mean(&DistributedContext::uninitialized(), &loss)
        .await
        .unwrap_err();
    assert!(matches!(err, runtime_core::Error::DistributedNotInitialized));
}
