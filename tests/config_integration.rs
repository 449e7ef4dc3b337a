use kernelmap::config::*;
use kernelmap::MapError;

#[test]
fn test_map_config_defaults() {
    let config = MapConfig::default();

    assert_eq!(config.build.mode, BuildMode::Independent);
    assert_eq!(config.build.min_probability, 0.0);
    assert_eq!(config.build.worker_count, 1);
    assert_eq!(config.build.max_radix_layers, 32);
    assert_eq!(config.build.max_list_length, 1_000_000);
    assert_eq!(config.probability.deg_invalid_instance, 0.99);
    assert_eq!(config.probability.deg_invalid_pointer, 0.90);
    assert_eq!(config.probability.deg_invalid_list_head, 0.90);
    assert_eq!(config.probability.deg_invalid_magic, 0.99);
    assert_eq!(config.heuristics.pointer_alignment, 4);
    assert_eq!(config.heuristics.per_cpu_offset_symbol, "__per_cpu_offset");
    assert_eq!(config.diff.granularity, 16);
    assert_eq!(config.diff.block_size, 1024);
}

#[test]
fn test_config_json_round_trip() {
    let mut config = MapConfig::default();
    config.build.mode = BuildMode::Propagating;
    config.build.worker_count = 8;
    config.heuristics.idr_type = "struct xarray".to_string();

    let json = config.to_json().unwrap();
    let back = MapConfig::from_json(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_config_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernelmap.json");
    std::fs::write(
        &path,
        r#"{ "build": { "mode": "SlabCache", "min_probability": 0.25 }, "diff": { "granularity": 64 } }"#,
    )
    .unwrap();

    let config = MapConfig::load(&path).unwrap();
    assert_eq!(config.build.mode, BuildMode::SlabCache);
    assert_eq!(config.build.min_probability, 0.25);
    assert_eq!(config.diff.granularity, 64);
    assert_eq!(config.diff.block_size, 1024);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_configs_rejected() {
    let mut config = MapConfig::default();
    config.build.worker_count = 0;
    assert!(matches!(config.validate(), Err(MapError::InvalidConfig(_))));

    let mut config = MapConfig::default();
    config.diff.block_size = 0;
    assert!(config.validate().is_err());

    let mut config = MapConfig::default();
    config.probability.deg_invalid_magic = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_malformed_json() {
    let err = MapConfig::from_json("{ build: ").unwrap_err();
    assert!(matches!(err, MapError::Serialization(_)));
}
