    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_validate_zero_dimensions() {
        let mut config = Config::default();
        config.engine.dimensions = 0;

        let result = ConfigValidator::validate(&config).unwrap();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.path == "engine.dimensions"));
    }

    #[test]
    fn test_validate_small_m() {
        let engine = EngineConfig {
            hnsw_m: 1,
            ..Default::default()
        };
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.errors.iter().any(|e| e.path == "engine.hnsw_m"));
    }

    #[test]
    fn test_validate_low_ef_search_warning() {
        let engine = EngineConfig {
            hnsw_ef_search: 4,
            ..Default::default()
        };
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.path == "engine.hnsw_ef_search"));
    }

    #[test]
    fn test_validate_pq_subspaces_must_divide() {
        let engine = EngineConfig {
            dimensions: 10,
            quantization: Quantization::Product,
            pq_subspaces: 4,
            ..Default::default()
        };
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.errors.iter().any(|e| e.path == "engine.pq_subspaces"));

        let engine = EngineConfig {
            dimensions: 12,
            quantization: Quantization::Product,
            pq_subspaces: 4,
            ..Default::default()
        };
        assert!(ConfigValidator::validate_engine(&engine).is_valid());
    }

    #[test]
    fn test_validate_pq_subspaces_ignored_without_product() {
        let engine = EngineConfig {
            dimensions: 10,
            pq_subspaces: 4,
            ..Default::default()
        };
        assert!(ConfigValidator::validate_engine(&engine).is_valid());
    }

    #[test]
    fn test_validate_zero_cache_size() {
        let engine = EngineConfig {
            cache_size: 0,
            ..Default::default()
        };
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.errors.iter().any(|e| e.path == "engine.cache_size"));
    }

    #[test]
    fn test_validate_dual_write_off_warning() {
        let engine = EngineConfig {
            dual_write: false,
            ..Default::default()
        };
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.path == "engine.dual_write"));
    }

    #[test]
    fn test_validate_data_dir_is_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let engine = EngineConfig::persistent(file.path(), 8);
        let result = ConfigValidator::validate_engine(&engine);
        assert!(result.errors.iter().any(|e| e.path == "engine.data_dir"));
    }

    #[test]
    fn test_into_result() {
        let engine = EngineConfig {
            hnsw_ef_search: 0,
            ..Default::default()
        };
        let err = ConfigValidator::validate_engine(&engine).into_result().unwrap_err();
        assert!(err.to_string().contains("hnsw_ef_search"));

        let ok = ConfigValidator::validate_engine(&EngineConfig::default()).into_result();
        assert!(ok.unwrap().is_empty());
    }

    #[test]
    fn test_validate_empty_log_filter() {
        let mut config = Config::default();
        config.logging.filter = "  ".to_string();
        let result = ConfigValidator::validate(&config).unwrap();
        assert!(result.errors.iter().any(|e| e.path == "logging.filter"));
    }
