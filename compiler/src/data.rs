// data.rs — Container descriptors
//
// Describes every named data container of a program: element type, shape,
// strides, offset, storage class, lifetime and whether the compiler owns it
// (`transient`). Shapes are symbolic.
//
// Preconditions: `shape`, `strides` and `offset` have equal length.
// Postconditions: constructors produce contiguous row-major layouts.
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::symbolic::Expr;

// ── Element type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(DType::Bool),
            "int32" => Ok(DType::Int32),
            "int64" => Ok(DType::Int64),
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            other => Err(format!("unknown element type '{other}'")),
        }
    }
}

// ── Descriptor kinds ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Scalar,
    Array,
    /// Reinterprets a subset of another container.
    View,
    /// Bound to a concrete container at runtime.
    Reference,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    #[default]
    Default,
    Register,
    CpuHeap,
    GpuGlobal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    #[default]
    Scope,
    State,
    Persistent,
}

// ── Descriptor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub kind: DataKind,
    pub dtype: DType,
    pub shape: Vec<Expr>,
    pub strides: Vec<Expr>,
    pub offset: Vec<Expr>,
    pub total_size: Expr,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub lifetime: Lifetime,
}

impl Data {
    /// A single element, stored as a rank-1 container of extent 1.
    pub fn scalar(dtype: DType) -> Self {
        Data {
            kind: DataKind::Scalar,
            dtype,
            shape: vec![Expr::one()],
            strides: vec![Expr::one()],
            offset: vec![Expr::zero()],
            total_size: Expr::one(),
            transient: false,
            storage: Storage::Default,
            lifetime: Lifetime::Scope,
        }
    }

    /// A contiguous row-major array.
    pub fn array(dtype: DType, shape: Vec<Expr>) -> Self {
        let strides = contiguous_strides(&shape);
        let total_size = Expr::product(shape.iter());
        let offset = vec![Expr::zero(); shape.len()];
        Data {
            kind: DataKind::Array,
            dtype,
            shape,
            strides,
            offset,
            total_size,
            transient: false,
            storage: Storage::Default,
            lifetime: Lifetime::Scope,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.kind == DataKind::Scalar
    }

    /// Prepend leading dimensions of the given extents.
    ///
    /// New leading strides are the running product of the existing total
    /// size with the prepended extents, innermost first. Leading offsets
    /// reuse the existing offset when all existing offsets agree, else zero.
    pub fn prepend_dims(&mut self, extents: &[Expr]) {
        let mut strides = self.strides.clone();
        let mut total = self.total_size.clone();
        for extent in extents.iter().rev() {
            strides.insert(0, total.clone());
            total = Expr::mul(&total, extent);
        }
        self.strides = strides;
        self.total_size = total;

        let mut shape = extents.to_vec();
        shape.extend(self.shape.iter().cloned());
        self.shape = shape;

        let unified = match self.offset.first() {
            Some(first) if self.offset.iter().all(|o| o == first) => first.clone(),
            _ => Expr::zero(),
        };
        let mut offset = vec![unified; extents.len()];
        offset.extend(self.offset.iter().cloned());
        self.offset = offset;

        if self.kind == DataKind::Scalar {
            self.kind = DataKind::Array;
        }
    }

    /// Symbols appearing in the layout of this container.
    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for e in self
            .shape
            .iter()
            .chain(&self.strides)
            .chain(&self.offset)
            .chain(std::iter::once(&self.total_size))
        {
            out.extend(e.free_symbols());
        }
        out
    }
}

/// Row-major strides for a shape.
pub fn contiguous_strides(shape: &[Expr]) -> Vec<Expr> {
    let mut strides = vec![Expr::one(); shape.len()];
    let mut acc = Expr::one();
    for i in (0..shape.len()).rev() {
        strides[i] = acc.clone();
        acc = Expr::mul(&acc, &shape[i]);
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_is_row_major() {
        let a = Data::array(DType::Float64, vec![Expr::sym("N"), Expr::sym("M")]);
        assert_eq!(a.strides, vec![Expr::sym("M"), Expr::one()]);
        assert_eq!(a.total_size.to_string(), "M*N");
    }

    #[test]
    fn prepend_dims_extends_layout() {
        let mut t = Data::array(DType::Float64, vec![Expr::int(4)]).transient();
        t.prepend_dims(&[Expr::int(10)]);
        assert_eq!(t.shape, vec![Expr::int(10), Expr::int(4)]);
        assert_eq!(t.strides, vec![Expr::int(4), Expr::int(1)]);
        assert_eq!(t.total_size, Expr::int(40));
        assert_eq!(t.offset, vec![Expr::zero(), Expr::zero()]);
    }

    #[test]
    fn prepend_dims_keeps_uniform_offset() {
        let mut t = Data::array(DType::Int32, vec![Expr::int(3), Expr::int(3)]);
        t.offset = vec![Expr::int(1), Expr::int(1)];
        t.prepend_dims(&[Expr::int(2), Expr::int(5)]);
        assert_eq!(t.offset, vec![Expr::int(1); 4]);
        assert_eq!(t.strides[0], Expr::int(45));
        assert_eq!(t.strides[1], Expr::int(9));
    }

    #[test]
    fn dtype_round_trips_through_text() {
        for d in [DType::Bool, DType::Int32, DType::Int64, DType::Float32, DType::Float64] {
            assert_eq!(d.to_string().parse::<DType>(), Ok(d));
        }
    }
}
