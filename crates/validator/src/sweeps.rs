//! Sweep definitions: JSON sweep files and the built-in MobileNetV3-Large
//! layer configurations.

use anyhow::{Context, Result};
use kernelprobe_kernels::{canonical_kernel_name, keys, KernelConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One kernel type and the configurations to validate it on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub kernel_type: String,
    pub configs: Vec<KernelConfig>,
}

impl Sweep {
    pub fn new(kernel_type: impl Into<String>, configs: Vec<KernelConfig>) -> Self {
        Self {
            kernel_type: kernel_type.into(),
            configs,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read sweep {}", path.display()))?;
        serde_json::from_str(&blob).with_context(|| format!("{} is not a sweep file", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Keeps the first `limit` configurations.
    pub fn truncated(mut self, limit: usize) -> Self {
        self.configs.truncate(limit);
        self
    }
}

const CONV_KEYS: &[&str] = &[keys::HW, keys::CIN, keys::COUT, keys::KERNEL_SIZE, keys::STRIDES];
const SPATIAL_KEYS: &[&str] = &[keys::HW, keys::CIN];
const AVGPOOL_KEYS: &[&str] = &[keys::HW, keys::CIN, keys::KERNEL_SIZE, keys::POOL_STRIDES];

const MOBILENETV3_CONV: &[[f64; 5]] = &[
    [224.0, 3.0, 16.0, 3.0, 2.0],
    [112.0, 16.0, 16.0, 1.0, 1.0],
    [112.0, 16.0, 64.0, 1.0, 1.0],
    [56.0, 64.0, 24.0, 1.0, 1.0],
    [56.0, 24.0, 72.0, 1.0, 1.0],
    [56.0, 72.0, 24.0, 1.0, 1.0],
    [56.0, 24.0, 72.0, 1.0, 1.0],
    [28.0, 72.0, 40.0, 1.0, 1.0],
    [28.0, 40.0, 120.0, 1.0, 1.0],
    [28.0, 120.0, 40.0, 1.0, 1.0],
    [28.0, 40.0, 120.0, 1.0, 1.0],
    [28.0, 120.0, 40.0, 1.0, 1.0],
    [28.0, 40.0, 240.0, 1.0, 1.0],
    [14.0, 240.0, 80.0, 1.0, 1.0],
    [14.0, 80.0, 200.0, 1.0, 1.0],
    [14.0, 200.0, 80.0, 1.0, 1.0],
    [14.0, 80.0, 184.0, 1.0, 1.0],
    [14.0, 184.0, 80.0, 1.0, 1.0],
    [14.0, 80.0, 184.0, 1.0, 1.0],
    [14.0, 184.0, 80.0, 1.0, 1.0],
    [14.0, 80.0, 480.0, 1.0, 1.0],
    [14.0, 480.0, 112.0, 1.0, 1.0],
    [14.0, 112.0, 672.0, 1.0, 1.0],
    [14.0, 672.0, 112.0, 1.0, 1.0],
    [14.0, 112.0, 672.0, 1.0, 1.0],
    [7.0, 672.0, 160.0, 1.0, 1.0],
    [7.0, 160.0, 960.0, 1.0, 1.0],
    [7.0, 960.0, 160.0, 1.0, 1.0],
    [7.0, 160.0, 960.0, 1.0, 1.0],
    [7.0, 960.0, 160.0, 1.0, 1.0],
    [7.0, 160.0, 960.0, 1.0, 1.0],
];

const MOBILENETV3_DWCONV: &[[f64; 5]] = &[
    [112.0, 16.0, 16.0, 3.0, 1.0],
    [112.0, 64.0, 64.0, 3.0, 2.0],
    [56.0, 72.0, 72.0, 3.0, 1.0],
    [56.0, 72.0, 72.0, 5.0, 2.0],
    [28.0, 120.0, 120.0, 5.0, 1.0],
    [28.0, 120.0, 120.0, 5.0, 1.0],
    [28.0, 240.0, 240.0, 3.0, 2.0],
    [14.0, 200.0, 200.0, 3.0, 1.0],
    [14.0, 184.0, 184.0, 3.0, 1.0],
    [14.0, 184.0, 184.0, 3.0, 1.0],
    [14.0, 480.0, 480.0, 3.0, 1.0],
    [14.0, 672.0, 672.0, 3.0, 1.0],
    [14.0, 672.0, 672.0, 5.0, 2.0],
    [7.0, 960.0, 960.0, 5.0, 1.0],
    [7.0, 960.0, 960.0, 5.0, 1.0],
];

const MOBILENETV3_HSWISH: &[[f64; 2]] = &[
    [112.0, 16.0],
    [28.0, 240.0],
    [14.0, 240.0],
    [14.0, 200.0],
    [14.0, 200.0],
    [14.0, 184.0],
    [14.0, 184.0],
    [14.0, 184.0],
    [14.0, 184.0],
    [14.0, 480.0],
    [14.0, 480.0],
    [14.0, 672.0],
    [14.0, 672.0],
    [14.0, 672.0],
    [7.0, 672.0],
    [7.0, 960.0],
    [7.0, 960.0],
    [7.0, 960.0],
    [7.0, 960.0],
    [7.0, 960.0],
    [1.0, 1280.0],
];

const MOBILENETV3_SE: &[[f64; 2]] = &[
    [28.0, 72.0],
    [28.0, 120.0],
    [28.0, 120.0],
    [14.0, 480.0],
    [14.0, 672.0],
    [7.0, 672.0],
    [7.0, 960.0],
    [7.0, 960.0],
];

const MOBILENETV3_AVGPOOL: &[[f64; 4]] = &[
    [56.0, 64.0, 1.0, 1.0],
    [56.0, 256.0, 2.0, 2.0],
    [28.0, 512.0, 2.0, 2.0],
    [14.0, 816.0, 2.0, 2.0],
];

/// Kernel types with a built-in sweep.
pub const BUILTIN_SWEEPS: &[&str] = &["conv-bn-relu", "dwconv-bn-relu", "hswish", "se", "avgpool"];

fn rows<const N: usize>(keys: &[&str], table: &[[f64; N]]) -> Vec<KernelConfig> {
    table.iter().map(|row| KernelConfig::from_pairs(keys, row)).collect()
}

/// The MobileNetV3-Large layer configurations of `kernel_type`, if any.
pub fn builtin_sweep(kernel_type: &str) -> Option<Sweep> {
    let canonical = canonical_kernel_name(kernel_type);
    let configs = match canonical.as_str() {
        "conv-bn-relu" => rows(CONV_KEYS, MOBILENETV3_CONV),
        "dwconv-bn-relu" => rows(CONV_KEYS, MOBILENETV3_DWCONV),
        "hswish" => rows(SPATIAL_KEYS, MOBILENETV3_HSWISH),
        "se" | "squeeze-excite" => rows(SPATIAL_KEYS, MOBILENETV3_SE),
        "avgpool" => rows(AVGPOOL_KEYS, MOBILENETV3_AVGPOOL),
        _ => return None,
    };
    let name = if canonical == "squeeze-excite" { "se".to_string() } else { canonical };
    Some(Sweep::new(name, configs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelprobe_ir::build_block;
    use kernelprobe_predictor::extract_features;

    #[test]
    fn builtin_sweeps_have_expected_sizes() {
        let sizes: Vec<_> = BUILTIN_SWEEPS
            .iter()
            .map(|name| builtin_sweep(name).unwrap().configs.len())
            .collect();
        assert_eq!(sizes, vec![31, 15, 21, 8, 4]);
        assert!(builtin_sweep("concat").is_none());
        assert_eq!(builtin_sweep("Conv_BN_ReLU").unwrap().kernel_type, "conv-bn-relu");
    }

    #[test]
    fn every_builtin_config_builds_and_extracts() {
        for name in BUILTIN_SWEEPS {
            let sweep = builtin_sweep(name).unwrap();
            for config in &sweep.configs {
                let block = build_block(&sweep.kernel_type, config)
                    .unwrap_or_else(|err| panic!("{name} {config}: {err}"));
                assert_eq!(block.inputs.len(), 1);
                extract_features(&sweep.kernel_type, config).unwrap();
            }
        }
    }

    #[test]
    fn sweep_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweeps").join("se.json");
        let sweep = builtin_sweep("se").unwrap().truncated(2);
        sweep.save(&path).unwrap();
        let loaded = Sweep::load(&path).unwrap();
        assert_eq!(loaded, sweep);

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["configs"][0]["HW"], 28.0);
    }
}
