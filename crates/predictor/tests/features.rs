use kernelprobe_kernels::{KernelConfig, KernelError};
use kernelprobe_predictor::{extract_features, schema_for, FEATURE_SCHEMAS, SCHEMA_VERSION};
use proptest::prelude::*;

fn full_config(schema_keys: &[&str], value: f64) -> KernelConfig {
    schema_keys.iter().map(|key| (*key, value)).collect()
}

#[test]
fn every_schema_resolves_by_name_and_extracts() {
    for schema in FEATURE_SCHEMAS {
        assert_eq!(schema_for(schema.kernel_type).unwrap(), schema);
        let features = extract_features(schema.kernel_type, &full_config(schema.keys, 4.0)).unwrap();
        assert_eq!(features.len(), schema.len());
        assert_eq!(features.schema_version, SCHEMA_VERSION);
    }
}

#[test]
fn pooling_cout_matches_the_built_block() {
    for kernel_type in ["avgpool", "maxpool"] {
        let config = KernelConfig::new()
            .with("HW", 16.0)
            .with("CIN", 24.0)
            .with("KERNEL_SIZE", 3.0)
            .with("POOL_STRIDES", 2.0);
        let block = kernelprobe_ir::build_block(kernel_type, &config).unwrap();
        assert_eq!(block.config.get("COUT"), Some(24.0));
        assert_eq!(block.outputs[0].channels(), 24);

        let features = extract_features(&block.kernel_type, &block.config).unwrap();
        assert_eq!(features.values, vec![16.0, 24.0, 24.0, 3.0, 2.0]);
        assert_eq!(features, extract_features(kernel_type, &config).unwrap());
    }
}

#[test]
fn extra_keys_are_ignored() {
    let config = KernelConfig::new()
        .with("HW", 28.0)
        .with("CIN", 72.0)
        .with("KERNEL_SIZE", 3.0);
    let features = extract_features("se", &config).unwrap();
    assert_eq!(features.values, vec![28.0, 72.0]);
}

#[test]
fn non_finite_value_is_rejected() {
    let config = KernelConfig::new().with("HW", f64::NAN).with("CIN", 8.0);
    let err = extract_features("relu", &config).unwrap_err();
    assert!(matches!(err, KernelError::InvalidConfigValue { ref key, .. } if key == "HW"));
}

proptest! {
    #[test]
    fn feature_extraction_is_deterministic(
        hw in 1u32..=224,
        cin in 1u32..=1024,
        cout in 1u32..=1024,
        k in prop::sample::select(vec![1u32, 3, 5, 7]),
        s in 1u32..=2,
    ) {
        let config = KernelConfig::new()
            .with("HW", hw as f64)
            .with("CIN", cin as f64)
            .with("COUT", cout as f64)
            .with("KERNEL_SIZE", k as f64)
            .with("STRIDES", s as f64);
        let first = extract_features("conv-bn-relu", &config).unwrap();
        let second = extract_features("conv_bn_relu", &config).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.values.len(), 7);
        prop_assert!(first.values[5] > 0.0);
        prop_assert!(first.values[6] > 0.0);
    }

    #[test]
    fn dwconv_params_ignore_cin_scaling(hw in 1u32..=112, c in 1u32..=960, k in 1u32..=7) {
        let config = KernelConfig::new()
            .with("HW", hw as f64)
            .with("CIN", c as f64)
            .with("KERNEL_SIZE", k as f64)
            .with("STRIDES", 1.0);
        let features = extract_features("dwconv-bn-relu", &config).unwrap();
        let expected = c as f64 * ((k * k) as f64 + 1.0) / 1e6;
        prop_assert!((features.values[6] - expected).abs() < 1e-12);
    }
}
