use std::time::Duration;

use anyhow::Result;
use medgemma_config::{
    AppConfig, ConfigOverrides, DEFAULT_MODEL_ID, InferenceOverride, LocalFileSystem,
    ResourceLocation, VirtualFileSystem, VirtualPath, save_config,
};
use medgemma_core::runtime::DeviceKind;

fn temp_fs() -> Result<(tempfile::TempDir, LocalFileSystem)> {
    let dir = tempfile::tempdir()?;
    let fs = LocalFileSystem::with_directories(
        "medgemma",
        dir.path().join("config"),
        dir.path().join("cache"),
    );
    Ok((dir, fs))
}

#[test]
fn first_load_writes_defaults() -> Result<()> {
    let (_dir, fs) = temp_fs()?;
    let (config, descriptor) = AppConfig::load_or_init(&fs, None)?;
    assert!(matches!(descriptor.location, ResourceLocation::Virtual(_)));
    assert!(fs.exists(&VirtualPath::config_file())?);
    assert_eq!(config.models.active, DEFAULT_MODEL_ID);
    assert_eq!(config.engine.cache.num_layers, 34);
    assert_eq!(config.engine.stop_token_ids, vec![1, 106]);

    let (reloaded, _) = AppConfig::load_or_init(&fs, None)?;
    assert!(reloaded.inference.stop_strings.is_empty());
    assert_eq!(
        reloaded.inference.normalized_stop_strings,
        ["END OF REPORT", "Generated by KintaMed"]
    );
    assert_eq!(reloaded.engine, config.engine);
    assert_eq!(reloaded.inference, config.inference);
    Ok(())
}

#[test]
fn overrides_take_precedence_over_the_file() -> Result<()> {
    let (dir, fs) = temp_fs()?;
    let model_dir = dir.path().join("export");
    let overrides = ConfigOverrides {
        model_dir: Some(model_dir.clone()),
        inference: InferenceOverride {
            device: Some(DeviceKind::Cpu),
            max_new_tokens: Some(64),
            temperature: Some(0.29),
            top_p: Some(0.75),
            repetition_penalty: Some(1.3),
            time_budget_secs: Some(30),
            stop_strings: vec!["Note:".into()],
            normalized_stop_strings: vec!["final report".into()],
            ..InferenceOverride::default()
        },
        ..ConfigOverrides::default()
    };
    let (config, _, resources) = AppConfig::load_with_overrides(&fs, overrides)?;

    let params = config.inference.decode_parameters();
    assert_eq!(params.max_new_tokens, 64);
    assert_eq!(params.temperature, 0.29);
    assert_eq!(params.top_p, 0.75);
    assert_eq!(params.repetition_penalty, 1.3);
    assert_eq!(params.time_budget, Some(Duration::from_secs(30)));
    assert_eq!(params.stop_strings, vec!["Note:".to_string()]);
    assert_eq!(params.normalized_stop_strings, vec!["final report".to_string()]);
    params.validate()?;

    assert_eq!(resources.decoder.to_path(&fs)?, model_dir.join("model.onnx"));
    assert_eq!(
        resources.tokenizer.to_path(&fs)?,
        model_dir.join("tokenizer.json")
    );
    Ok(())
}

#[test]
fn unset_model_dir_resolves_into_the_cache() -> Result<()> {
    let (dir, fs) = temp_fs()?;
    let (config, _) = AppConfig::load_or_init(&fs, None)?;
    let resources = config.active_model_resources()?;
    let expected = dir
        .path()
        .join("cache/models")
        .join(DEFAULT_MODEL_ID)
        .join("vision_projection.onnx");
    assert_eq!(resources.projector.to_path(&fs)?, expected);
    Ok(())
}

#[test]
fn physical_config_round_trips_edits() -> Result<()> {
    let (dir, fs) = temp_fs()?;
    let path = dir.path().join("custom/medgemma.toml");
    let (mut config, descriptor) = AppConfig::load_or_init(&fs, Some(&path))?;
    assert!(path.exists());

    config.inference.prefill_chunk = Some(16);
    config.engine.image_tokens = 64;
    save_config(&fs, &descriptor, &config)?;

    let (reloaded, _) = AppConfig::load_or_init(&fs, Some(&path))?;
    assert_eq!(reloaded.inference.prefill_chunk, Some(16));
    assert_eq!(reloaded.engine.image_tokens, 64);
    Ok(())
}

#[test]
fn invalid_engine_section_is_rejected() -> Result<()> {
    let (dir, fs) = temp_fs()?;
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[engine]\nhidden_size = 0\n")?;
    let err = AppConfig::load_or_init(&fs, Some(&path))
        .err()
        .expect("validation error");
    assert!(format!("{err:#}").contains("hidden_size"));
    Ok(())
}
