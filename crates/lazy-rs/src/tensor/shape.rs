//! Static tensor shapes.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Inline capacity covers every rank the registered operations produce.
type Dims = SmallVec<[usize; 4]>;

/// Logical dimensions of a tensor. Rank zero denotes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new(dims: impl AsRef<[usize]>) -> Self {
        Shape {
            dims: SmallVec::from_slice(dims.as_ref()),
        }
    }

    pub fn scalar() -> Self {
        Shape {
            dims: SmallVec::new(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements; `1` for scalars, `0` when any extent is zero.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Extent of `axis`, or `None` when the axis is out of range.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Row-major strides for a dense buffer of this shape.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }

    /// Normalizes a possibly negative axis against this shape's rank.
    pub fn normalize_axis(&self, axis: i64) -> Option<usize> {
        let rank = self.rank() as i64;
        let resolved = if axis < 0 { axis + rank } else { axis };
        if (0..rank).contains(&resolved) {
            Some(resolved as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(Shape::new([2, 3, 4]).strides(), vec![12, 4, 1]);
        assert!(Shape::scalar().strides().is_empty());
    }

    #[test]
    fn negative_axes_wrap_once() {
        let shape = Shape::new([2, 3]);
        assert_eq!(shape.normalize_axis(-1), Some(1));
        assert_eq!(shape.normalize_axis(-3), None);
        assert_eq!(shape.normalize_axis(2), None);
    }

    #[test]
    fn display_lists_extents() {
        assert_eq!(Shape::new([1, 32]).to_string(), "[1, 32]");
        assert_eq!(Shape::scalar().element_count(), 1);
    }
}
