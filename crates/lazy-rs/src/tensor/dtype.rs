//! Scalar element types understood by the runtime and its backends.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between host tensors and backend handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit IEEE-754 floating point.
    F32,
    /// 32-bit signed integer, used for index tensors.
    Si32,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Si32 => "si32",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
