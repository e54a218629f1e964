//! Feature extraction with pinned, versioned schemas.
//!
//! A predictor only gives meaningful estimates when it receives features in
//! exactly the order it was trained on. Every kernel type therefore has one
//! static [`FeatureSchema`]; changing a key list or a derived feature means
//! bumping [`SCHEMA_VERSION`].

use kernelprobe_kernels::{canonical_kernel_name, keys, KernelConfig, KernelError};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

pub const NORMALIZED_FLOPS: &str = "normalized_flops";
pub const NORMALIZED_PARAMS: &str = "normalized_params";

const FLOPS_SCALE: f64 = 2e6;
const PARAMS_SCALE: f64 = 1e6;

const CONV_KEYS: &[&str] = &[keys::HW, keys::CIN, keys::COUT, keys::KERNEL_SIZE, keys::STRIDES];
const POOL_KEYS: &[&str] = &[
    keys::HW,
    keys::CIN,
    keys::COUT,
    keys::KERNEL_SIZE,
    keys::POOL_STRIDES,
];
const CONCAT_KEYS: &[&str] = &[keys::HW, keys::CIN1, keys::CIN2, keys::CIN3, keys::CIN4];
const SPATIAL_KEYS: &[&str] = &[keys::HW, keys::CIN];
const FC_KEYS: &[&str] = &[keys::CIN, keys::COUT];

/// Closed-form convolution cost appended after the raw keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedFeatures {
    Conv,
    DepthwiseConv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureSchema {
    pub kernel_type: &'static str,
    pub aliases: &'static [&'static str],
    pub keys: &'static [&'static str],
    pub derived: Option<DerivedFeatures>,
    pub version: u32,
}

impl FeatureSchema {
    const fn raw(kernel_type: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            kernel_type,
            aliases: &[],
            keys,
            derived: None,
            version: SCHEMA_VERSION,
        }
    }

    const fn derived(mut self, derived: DerivedFeatures) -> Self {
        self.derived = Some(derived);
        self
    }

    const fn aliased(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len() + if self.derived.is_some() { 2 } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered names of every feature, derived ones last.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keys.iter().map(|key| key.to_string()).collect();
        if self.derived.is_some() {
            names.push(NORMALIZED_FLOPS.to_string());
            names.push(NORMALIZED_PARAMS.to_string());
        }
        names
    }

    fn matches(&self, canonical: &str) -> bool {
        self.kernel_type == canonical || self.aliases.contains(&canonical)
    }
}

pub const FEATURE_SCHEMAS: &[FeatureSchema] = &[
    FeatureSchema::raw("conv-bn-relu", CONV_KEYS).derived(DerivedFeatures::Conv),
    FeatureSchema::raw("dwconv-bn-relu", CONV_KEYS).derived(DerivedFeatures::DepthwiseConv),
    FeatureSchema::raw("se", SPATIAL_KEYS).aliased(&["squeeze-excite"]),
    FeatureSchema::raw("hswish", SPATIAL_KEYS),
    FeatureSchema::raw("avgpool", POOL_KEYS),
    FeatureSchema::raw("concat", CONCAT_KEYS),
    FeatureSchema::raw("conv-bn-relu6", CONV_KEYS),
    FeatureSchema::raw("conv-bn", CONV_KEYS),
    FeatureSchema::raw("conv-relu", CONV_KEYS),
    FeatureSchema::raw("conv-relu6", CONV_KEYS),
    FeatureSchema::raw("conv-hswish", CONV_KEYS),
    FeatureSchema::raw("conv", CONV_KEYS),
    FeatureSchema::raw("conv-bn-hswish", CONV_KEYS),
    FeatureSchema::raw("conv-bn-relu-maxpool", CONV_KEYS),
    FeatureSchema::raw("dwconv-bn", CONV_KEYS),
    FeatureSchema::raw("dwconv-relu", CONV_KEYS),
    FeatureSchema::raw("dwconv-relu6", CONV_KEYS),
    FeatureSchema::raw("dwconv-bn-relu6", CONV_KEYS),
    FeatureSchema::raw("dwconv", CONV_KEYS),
    FeatureSchema::raw("dwconv-bn-hswish", CONV_KEYS),
    FeatureSchema::raw("maxpool", POOL_KEYS),
    FeatureSchema::raw("fc", FC_KEYS).aliased(&["linear"]),
    FeatureSchema::raw("bn", SPATIAL_KEYS),
    FeatureSchema::raw("relu", SPATIAL_KEYS),
    FeatureSchema::raw("bn-relu", SPATIAL_KEYS),
    FeatureSchema::raw("add", SPATIAL_KEYS),
    FeatureSchema::raw("add-relu", SPATIAL_KEYS),
    FeatureSchema::raw("split", SPATIAL_KEYS),
    FeatureSchema::raw("channel-shuffle", SPATIAL_KEYS).aliased(&["channelshuffle", "shuffle"]),
];

pub fn schema_for(kernel_type: &str) -> Result<&'static FeatureSchema, KernelError> {
    let canonical = canonical_kernel_name(kernel_type);
    FEATURE_SCHEMAS
        .iter()
        .find(|schema| schema.matches(&canonical))
        .ok_or_else(|| KernelError::UnknownKernelType(kernel_type.to_string()))
}

/// Ordered predictor input for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub kernel_type: String,
    pub schema_version: u32,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Maps a config to the feature vector of its kernel type. `COUT` falls
/// back to `CIN` when the schema needs it and the config omits it.
pub fn extract_features(kernel_type: &str, config: &KernelConfig) -> Result<FeatureVector, KernelError> {
    let schema = schema_for(kernel_type)?;
    let config = if schema.keys.contains(&keys::COUT) {
        config.with_default_cout()
    } else {
        config.clone()
    };

    let mut values = schema
        .keys
        .iter()
        .map(|key| config.require(schema.kernel_type, key))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(derived) = schema.derived {
        let (flops, params) = conv_flops_params(derived, &values);
        values.push(flops / FLOPS_SCALE);
        values.push(params / PARAMS_SCALE);
    }

    Ok(FeatureVector {
        kernel_type: schema.kernel_type.to_string(),
        schema_version: schema.version,
        values,
    })
}

/// Raw `(flops, params)` of a same-padded convolution from the ordered
/// `[HW, CIN, COUT, KERNEL_SIZE, STRIDES]` values. Divisions stay in
/// floating point, matching how the predictors were trained.
pub fn conv_flops_params(kind: DerivedFeatures, values: &[f64]) -> (f64, f64) {
    let [hw, cin, cout, k, stride] = match values {
        [hw, cin, cout, k, stride, ..] => [*hw, *cin, *cout, *k, *stride],
        _ => return (0.0, 0.0),
    };
    let params = match kind {
        DerivedFeatures::Conv => cout * (k * k * cin + 1.0),
        DerivedFeatures::DepthwiseConv => cout * (k * k + 1.0),
    };
    let flops = 2.0 * (hw / stride) * (hw / stride) * params;
    (flops, params)
}
