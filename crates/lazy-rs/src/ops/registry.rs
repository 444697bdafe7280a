//! Operation identities and their dispatch classification.
//!
//! The registry is built once from a declarative manifest (JSON) listing three disjoint sets of
//! operation names. Names and aliases are resolved to [`OpKind`] exactly once, so the rest of the
//! runtime never compares strings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

const DEFAULT_MANIFEST: &str = include_str!("manifest.json");

static DEFAULT_REGISTRY: Lazy<Arc<OpRegistry>> = Lazy::new(|| {
    // The embedded manifest is covered by unit tests; an invalid one is a build defect.
    let registry = OpRegistry::from_json(DEFAULT_MANIFEST)
        .unwrap_or_else(|err| panic!("embedded operation manifest is invalid: {err}"));
    Arc::new(registry)
});

macro_rules! op_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Stable identity of every operation the runtime can record.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OpKind {
            $(#[serde(rename = $name)] $variant,)+
        }

        impl OpKind {
            pub const ALL: &'static [OpKind] = &[$(OpKind::$variant,)+];

            /// Canonical operation name, as used in manifests and counter keys.
            pub fn name(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name,)+
                }
            }

            /// Looks up a canonical name. Aliases are resolved by [`OpRegistry::resolve`].
            pub fn from_name(name: &str) -> Option<OpKind> {
                match name {
                    $($name => Some(OpKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

op_kinds! {
    Add => "add",
    Sub => "sub",
    Mul => "mul",
    Div => "div",
    Maximum => "maximum",
    Minimum => "minimum",
    Pow => "pow",
    Neg => "neg",
    Abs => "abs",
    Exp => "exp",
    Log => "log",
    Tanh => "tanh",
    Sigmoid => "sigmoid",
    Relu => "relu",
    Sqrt => "sqrt",
    Rsqrt => "rsqrt",
    Reciprocal => "reciprocal",
    Clone => "clone",
    Clamp => "clamp",
    Matmul => "matmul",
    Transpose => "transpose",
    Reshape => "reshape",
    Narrow => "narrow",
    Sum => "sum",
    Mean => "mean",
    Softmax => "softmax",
    IndexSelect => "index_select",
    Conv2d => "conv2d",
    ConvolutionBackward => "convolution_backward",
    TransformBiasRescaleQkv => "transform_bias_rescale_qkv",
    Cumsum => "cumsum",
    Lgamma => "lgamma",
}

impl OpKind {
    /// Accepted number of inputs.
    pub fn arity(self) -> RangeInclusive<usize> {
        match self {
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Maximum
            | OpKind::Minimum
            | OpKind::Pow
            | OpKind::Matmul
            | OpKind::IndexSelect
            | OpKind::TransformBiasRescaleQkv => 2..=2,
            // Bias is optional.
            OpKind::Conv2d => 2..=3,
            OpKind::ConvolutionBackward => 3..=3,
            _ => 1..=1,
        }
    }

    /// Number of tensors one invocation produces.
    pub fn output_count(self) -> usize {
        match self {
            OpKind::ConvolutionBackward | OpKind::TransformBiasRescaleQkv => 3,
            _ => 1,
        }
    }

    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Maximum
                | OpKind::Minimum
                | OpKind::Pow
        )
    }

    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            OpKind::Neg
                | OpKind::Abs
                | OpKind::Exp
                | OpKind::Log
                | OpKind::Tanh
                | OpKind::Sigmoid
                | OpKind::Relu
                | OpKind::Sqrt
                | OpKind::Rsqrt
                | OpKind::Reciprocal
                | OpKind::Clone
        )
    }

    pub(crate) fn arity_label(self) -> String {
        let arity = self.arity();
        if arity.start() == arity.end() {
            arity.start().to_string()
        } else {
            format!("{} to {}", arity.start(), arity.end())
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dispatch classification of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Eligible for lowering into a compiled region.
    Compiled,
    /// Always executed as a single direct kernel call.
    Fallback,
    /// Recording succeeds but dispatch fails with `UnsupportedOperation`.
    Unsupported,
}

/// Declarative input for [`OpRegistry::from_manifest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationManifest {
    #[serde(default)]
    pub compiled: Vec<String>,
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default)]
    pub unsupported: Vec<String>,
    /// Alternative name -> canonical name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Registered operations that verification harnesses should skip.
    #[serde(default)]
    pub unverified: Vec<String>,
}

impl OperationManifest {
    /// The manifest embedded in the crate.
    pub fn default_manifest() -> Result<Self> {
        Self::from_json(DEFAULT_MANIFEST)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| RuntimeError::manifest(err.to_string()))
    }
}

/// Immutable mapping from operation identity to classification.
#[derive(Debug, Clone)]
pub struct OpRegistry {
    classes: HashMap<OpKind, Classification>,
    aliases: HashMap<String, OpKind>,
    unverified: BTreeSet<OpKind>,
}

impl OpRegistry {
    /// Shared registry built from the embedded manifest.
    pub fn default_registry() -> Arc<OpRegistry> {
        Arc::clone(&DEFAULT_REGISTRY)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_manifest(&OperationManifest::from_json(json)?)
    }

    /// Validates `manifest` and builds the registry.
    ///
    /// Rejects names that are not known operations, operations listed in more than one set,
    /// aliases that shadow a canonical name or point at an unregistered operation, and
    /// unverified entries that are not registered.
    pub fn from_manifest(manifest: &OperationManifest) -> Result<Self> {
        let mut classes = HashMap::new();
        let sets = [
            (Classification::Compiled, &manifest.compiled),
            (Classification::Fallback, &manifest.fallback),
            (Classification::Unsupported, &manifest.unsupported),
        ];
        for (class, names) in sets {
            for name in names {
                let op = OpKind::from_name(name).ok_or_else(|| {
                    RuntimeError::manifest(format!("`{name}` is not a known operation"))
                })?;
                if let Some(previous) = classes.insert(op, class) {
                    return Err(RuntimeError::manifest(format!(
                        "`{name}` is listed as both {previous:?} and {class:?}"
                    )));
                }
            }
        }

        let mut aliases = HashMap::new();
        for (alias, target) in &manifest.aliases {
            if OpKind::from_name(alias).is_some() {
                return Err(RuntimeError::manifest(format!(
                    "alias `{alias}` shadows a canonical operation name"
                )));
            }
            let op = OpKind::from_name(target)
                .filter(|op| classes.contains_key(op))
                .ok_or_else(|| {
                    RuntimeError::manifest(format!(
                        "alias `{alias}` targets unregistered operation `{target}`"
                    ))
                })?;
            aliases.insert(alias.clone(), op);
        }

        let mut unverified = BTreeSet::new();
        for name in &manifest.unverified {
            let op = OpKind::from_name(name)
                .filter(|op| classes.contains_key(op))
                .ok_or_else(|| {
                    RuntimeError::manifest(format!(
                        "unverified entry `{name}` is not a registered operation"
                    ))
                })?;
            unverified.insert(op);
        }

        Ok(OpRegistry {
            classes,
            aliases,
            unverified,
        })
    }

    /// Resolves a name or alias to a registered operation.
    ///
    /// An overload suffix (`add.Tensor`) is ignored.
    pub fn resolve(&self, name: &str) -> Result<OpKind> {
        let base = name.split_once('.').map_or(name, |(base, _)| base);
        let op = self
            .aliases
            .get(base)
            .copied()
            .or_else(|| OpKind::from_name(base));
        match op {
            Some(op) if self.classes.contains_key(&op) => Ok(op),
            _ => Err(RuntimeError::UnknownOperation {
                name: name.to_string(),
            }),
        }
    }

    pub fn classify(&self, op: OpKind) -> Result<Classification> {
        self.classes
            .get(&op)
            .copied()
            .ok_or_else(|| RuntimeError::UnknownOperation {
                name: op.name().to_string(),
            })
    }

    pub fn classify_name(&self, name: &str) -> Result<Classification> {
        self.classify(self.resolve(name)?)
    }

    pub fn is_registered(&self, op: OpKind) -> bool {
        self.classes.contains_key(&op)
    }

    /// Registered operations in canonical order.
    pub fn operations(&self) -> Vec<OpKind> {
        OpKind::ALL
            .iter()
            .copied()
            .filter(|op| self.classes.contains_key(op))
            .collect()
    }

    /// Registered operations minus the manifest's `unverified` list.
    pub fn verified_operations(&self) -> Vec<OpKind> {
        self.operations()
            .into_iter()
            .filter(|op| !self.unverified.contains(op))
            .collect()
    }

    pub fn operations_with(&self, class: Classification) -> Vec<OpKind> {
        self.operations()
            .into_iter()
            .filter(|op| self.classes.get(op) == Some(&class))
            .collect()
    }

    pub fn aliases_of(&self, op: OpKind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(_, target)| **target == op)
            .map(|(alias, _)| alias.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}
