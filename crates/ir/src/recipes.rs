//! Named block topologies as data.

pub use kernelprobe_kernels::canonical_kernel_name;
use kernelprobe_kernels::keys;
use kernelprobe_kernels::OperatorKind::{self, *};
use serde::Serialize;

/// How a recipe derives its input tensors from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLayout {
    /// One `(CIN, HW, HW)` tensor.
    Spatial,
    /// One `(CIN)` feature vector.
    Flat,
    /// One `(CINi, HW, HW)` tensor per non-zero `CIN1..CIN4`.
    ConcatBranches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recipe {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub ops: &'static [OperatorKind],
    pub input: InputLayout,
    /// `COUT` defaults to `CIN` for these kernels.
    pub channel_preserving: bool,
}

impl Recipe {
    const fn spatial(name: &'static str, ops: &'static [OperatorKind], channel_preserving: bool) -> Self {
        Self {
            name,
            aliases: &[],
            ops,
            input: InputLayout::Spatial,
            channel_preserving,
        }
    }

    const fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    const fn with_input(mut self, input: InputLayout) -> Self {
        self.input = input;
        self
    }

    pub fn matches(&self, canonical: &str) -> bool {
        self.name == canonical || self.aliases.contains(&canonical)
    }

    pub fn op_names(&self) -> Vec<&'static str> {
        self.ops.iter().map(OperatorKind::as_str).collect()
    }

    /// Config keys a build reads, input keys first. `COUT` is omitted for
    /// channel-preserving recipes since it defaults to `CIN`.
    pub fn config_keys(&self) -> Vec<&'static str> {
        let mut required: Vec<&'static str> = match self.input {
            InputLayout::Spatial => vec![keys::HW, keys::CIN],
            InputLayout::Flat => vec![keys::CIN],
            InputLayout::ConcatBranches => {
                let mut list = vec![keys::HW];
                list.extend(keys::CONCAT_BRANCHES);
                list
            }
        };
        for kind in self.ops {
            for key in kind.config_keys() {
                if required.contains(key) || (self.channel_preserving && *key == keys::COUT) {
                    continue;
                }
                required.push(*key);
            }
        }
        required
    }
}

pub const DEFAULT_RECIPES: &[Recipe] = &[
    Recipe::spatial("conv-bn-relu", &[Conv, BatchNorm, Relu], false),
    Recipe::spatial("conv-bn-relu6", &[Conv, BatchNorm, Relu6], false),
    Recipe::spatial("conv-bn", &[Conv, BatchNorm], false),
    Recipe::spatial("conv-relu", &[Conv, Relu], false),
    Recipe::spatial("conv-relu6", &[Conv, Relu6], false),
    Recipe::spatial("conv-hswish", &[Conv, Hswish], false),
    Recipe::spatial("conv", &[Conv], false),
    Recipe::spatial("conv-bn-hswish", &[Conv, BatchNorm, Hswish], false),
    Recipe::spatial("conv-bn-relu-maxpool", &[Conv, BatchNorm, Relu, MaxPool], false),
    Recipe::spatial("dwconv-bn", &[DwConv, BatchNorm], true),
    Recipe::spatial("dwconv-relu", &[DwConv, Relu], true),
    Recipe::spatial("dwconv-relu6", &[DwConv, Relu6], true),
    Recipe::spatial("dwconv-bn-relu", &[DwConv, BatchNorm, Relu], true),
    Recipe::spatial("dwconv-bn-relu6", &[DwConv, BatchNorm, Relu6], true),
    Recipe::spatial("dwconv", &[DwConv], true),
    Recipe::spatial("dwconv-bn-hswish", &[DwConv, BatchNorm, Hswish], true),
    Recipe::spatial("maxpool", &[MaxPool], true),
    Recipe::spatial("avgpool", &[AvgPool], true),
    Recipe::spatial("fc", &[Fc], false)
        .with_input(InputLayout::Flat)
        .with_aliases(&["linear"]),
    Recipe::spatial("concat", &[Concat], true).with_input(InputLayout::ConcatBranches),
    Recipe::spatial("split", &[Split], true),
    Recipe::spatial("channel-shuffle", &[ChannelShuffle], true)
        .with_aliases(&["channelshuffle", "shuffle"]),
    Recipe::spatial("se", &[SqueezeExcite], true).with_aliases(&["squeeze-excite"]),
    Recipe::spatial("bn-relu", &[BatchNorm, Relu], true),
    Recipe::spatial("bn", &[BatchNorm], true),
    Recipe::spatial("hswish", &[Hswish], true),
    Recipe::spatial("relu", &[Relu], true),
    Recipe::spatial("add-relu", &[Add, Relu], true),
    Recipe::spatial("add", &[Add], true),
];
