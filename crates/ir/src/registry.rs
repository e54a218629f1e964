//! Recipe registry for lookup and discovery.

use crate::builder::{BlockBuilder, KernelBlock};
use crate::recipes::{canonical_kernel_name, InputLayout, Recipe, DEFAULT_RECIPES};
use kernelprobe_kernels::{keys, KernelConfig, KernelError, TensorShape};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    recipes: Vec<Recipe>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self {
            recipes: Vec::new(),
        }
    }

    pub fn with_default_recipes() -> Self {
        let mut registry = Self::new();
        for recipe in DEFAULT_RECIPES {
            registry.register(*recipe);
        }
        registry
    }

    /// Adds a recipe; a later registration shadows an earlier one of the
    /// same name.
    pub fn register(&mut self, recipe: Recipe) {
        self.recipes.retain(|existing| existing.name != recipe.name);
        self.recipes.push(recipe);
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn find(&self, kernel_type: &str) -> Option<&Recipe> {
        let canonical = canonical_kernel_name(kernel_type);
        self.recipes.iter().find(|recipe| recipe.matches(&canonical))
    }

    pub fn resolve(&self, kernel_type: &str) -> Result<&Recipe, KernelError> {
        self.find(kernel_type)
            .ok_or_else(|| KernelError::UnknownKernelType(kernel_type.to_string()))
    }

    /// Builds the block registered under `kernel_type` for one config.
    pub fn build(&self, kernel_type: &str, config: &KernelConfig) -> Result<KernelBlock, KernelError> {
        let recipe = self.resolve(kernel_type)?;
        let config = if recipe.channel_preserving {
            config.with_default_cout()
        } else {
            config.clone()
        };
        let inputs = input_shapes(recipe, &config)?;
        debug!(
            kernel_type = recipe.name,
            config = %config,
            ops = recipe.ops.len(),
            "building kernel block"
        );

        recipe
            .ops
            .iter()
            .try_fold(BlockBuilder::new(recipe.name, config.clone(), inputs), |builder, kind| {
                builder.then(*kind)
            })
            .map(BlockBuilder::build)
    }
}

/// Declared block inputs for a recipe's layout.
pub fn input_shapes(recipe: &Recipe, config: &KernelConfig) -> Result<Vec<TensorShape>, KernelError> {
    let kernel_type = recipe.name;
    match recipe.input {
        InputLayout::Spatial => {
            let hw = config.positive_dim(kernel_type, keys::HW)?;
            let cin = config.positive_dim(kernel_type, keys::CIN)?;
            Ok(vec![TensorShape::square(cin, hw)])
        }
        InputLayout::Flat => {
            let cin = config.positive_dim(kernel_type, keys::CIN)?;
            Ok(vec![TensorShape::flat(cin)])
        }
        InputLayout::ConcatBranches => {
            let hw = config.positive_dim(kernel_type, keys::HW)?;
            let mut shapes = Vec::new();
            for key in keys::CONCAT_BRANCHES {
                // zero-channel branches are placeholders for absent inputs
                let channels = config.dim(kernel_type, key)?;
                if channels > 0 {
                    shapes.push(TensorShape::square(channels, hw));
                }
            }
            if shapes.is_empty() {
                return Err(KernelError::invalid_value(
                    kernel_type,
                    keys::CIN1,
                    0,
                    "at least one concat branch needs channels",
                ));
            }
            Ok(shapes)
        }
    }
}

/// Builds a block with the default recipe table.
pub fn build_block(kernel_type: &str, config: &KernelConfig) -> Result<KernelBlock, KernelError> {
    RecipeRegistry::with_default_recipes().build(kernel_type, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelprobe_kernels::OperatorKind;

    #[test]
    fn default_registry_resolves_aliases() {
        let registry = RecipeRegistry::with_default_recipes();
        assert_eq!(registry.recipes().len(), DEFAULT_RECIPES.len());
        assert_eq!(registry.resolve("conv_bn_relu").unwrap().name, "conv-bn-relu");
        assert_eq!(registry.resolve("linear").unwrap().name, "fc");
        assert_eq!(
            registry.resolve("conv-gelu"),
            Err(KernelError::UnknownKernelType("conv-gelu".into()))
        );
    }

    #[test]
    fn registering_replaces_same_name() {
        let mut registry = RecipeRegistry::with_default_recipes();
        let before = registry.recipes().len();
        registry.register(Recipe {
            name: "relu",
            aliases: &[],
            ops: &[OperatorKind::Relu6],
            input: InputLayout::Spatial,
            channel_preserving: true,
        });
        assert_eq!(registry.recipes().len(), before);
        assert_eq!(registry.resolve("relu").unwrap().ops, &[OperatorKind::Relu6]);
    }

    #[test]
    fn concat_requires_one_branch() {
        let config = KernelConfig::new()
            .with("HW", 14.0)
            .with("CIN1", 0.0)
            .with("CIN2", 0.0)
            .with("CIN3", 0.0)
            .with("CIN4", 0.0);
        let err = build_block("concat", &config).unwrap_err();
        assert!(err.is_configuration());
    }
}
