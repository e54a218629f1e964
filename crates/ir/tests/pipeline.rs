use anyhow::Result;
use kernelprobe_ir::{build_block, OnnxExporter, RecipeRegistry};
use kernelprobe_kernels::{KernelConfig, TensorShape};

fn generic_config() -> KernelConfig {
    KernelConfig::new()
        .with("HW", 8.0)
        .with("CIN", 8.0)
        .with("COUT", 8.0)
        .with("KERNEL_SIZE", 3.0)
        .with("STRIDES", 1.0)
        .with("POOL_STRIDES", 2.0)
        .with("CIN1", 4.0)
        .with("CIN2", 4.0)
        .with("CIN3", 4.0)
        .with("CIN4", 4.0)
}

#[test]
fn every_recipe_builds_runs_and_exports() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = RecipeRegistry::with_default_recipes();
    let exporter = OnnxExporter::default();
    let config = generic_config();

    for recipe in registry.recipes() {
        let block = registry.build(recipe.name, &config)?;
        assert_eq!(block.units.len(), recipe.ops.len(), "{}", recipe.name);

        let outputs = block.forward(&block.sample_inputs())?;
        let produced: Vec<Vec<usize>> = outputs.iter().map(|t| t.shape().to_vec()).collect();
        let declared: Vec<Vec<usize>> = block.outputs.iter().map(TensorShape::dims).collect();
        assert_eq!(produced, declared, "{}", recipe.name);

        let path = dir.path().join(format!("{}.onnx", recipe.name));
        exporter.export(&block, &path)?;
        assert!(std::fs::metadata(&path)?.len() > 0, "{}", recipe.name);
    }
    Ok(())
}

#[test]
fn building_twice_yields_identical_blocks() -> Result<()> {
    let config = generic_config();
    for kernel_type in ["conv-bn-relu", "dwconv-bn-hswish", "se", "fc", "concat"] {
        let first = build_block(kernel_type, &config)?;
        let second = build_block(kernel_type, &config)?;
        assert_eq!(first, second, "{kernel_type}");
        assert_eq!(first.structure(), second.structure());

        let exporter = OnnxExporter::default();
        assert_eq!(
            exporter.to_model(&first)?.to_bytes(),
            exporter.to_model(&second)?.to_bytes()
        );
    }
    Ok(())
}

#[test]
fn concat_drops_zero_channel_branches() -> Result<()> {
    let config = KernelConfig::new()
        .with("HW", 14.0)
        .with("CIN1", 72.0)
        .with("CIN2", 0.0)
        .with("CIN3", 40.0)
        .with("CIN4", 0.0);
    let block = build_block("concat", &config)?;
    assert_eq!(
        block.inputs,
        vec![TensorShape::square(72, 14), TensorShape::square(40, 14)]
    );
    assert_eq!(block.outputs, vec![TensorShape::square(112, 14)]);
    assert_eq!(block.input_names(), vec!["input_0", "input_1"]);
    Ok(())
}
