// memlet.rs — Data-movement descriptors
//
// A memlet names the container an edge moves data from or to, the subset of
// that container, an optional paired subset on the other endpoint (for
// copies between containers of different shape), and an optional
// write-conflict reducer.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::Data;
use crate::subset::Range;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Memlet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_subset: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wcr: Option<String>,
    /// Accessed a data-dependent number of times.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,
}

impl Memlet {
    /// Control-only edge that carries no data.
    pub fn empty() -> Self {
        Memlet::default()
    }

    pub fn new(data: impl Into<String>, subset: Range) -> Self {
        Memlet {
            data: Some(data.into()),
            subset: Some(subset),
            ..Memlet::default()
        }
    }

    /// Parse the subset from text, e.g. `Memlet::simple("A", "0:N")`.
    pub fn simple(data: &str, subset: &str) -> Result<Self, crate::symbolic::ExprParseError> {
        Ok(Memlet::new(data, Range::parse(subset)?))
    }

    /// The whole container.
    pub fn from_data(name: &str, desc: &Data) -> Self {
        Memlet::new(name, Range::from_shape(&desc.shape))
    }

    pub fn with_wcr(mut self, wcr: impl Into<String>) -> Self {
        self.wcr = Some(wcr.into());
        self
    }

    pub fn with_other_subset(mut self, other: Range) -> Self {
        self.other_subset = Some(other);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn data_name(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn refers_to(&self, name: &str) -> bool {
        self.data.as_deref() == Some(name)
    }

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for r in self.subset.iter().chain(self.other_subset.iter()) {
            out.extend(r.free_symbols());
        }
        out
    }
}

/// Canonical memlet text. A reducer adds the conflict multiplicity, which is
/// the element count of the written subset: `B(10, sum)[0:10]`.
impl fmt::Display for Memlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(data) = &self.data else {
            return write!(f, "[empty]");
        };
        write!(f, "{data}")?;
        if let Some(wcr) = &self.wcr {
            let written = self.subset.as_ref().map(|s| s.num_elements());
            match written {
                Some(n) => write!(f, "({n}, {wcr})")?,
                None => write!(f, "(1, {wcr})")?,
            }
        }
        if let Some(subset) = &self.subset {
            write!(f, "[{subset}]")?;
        }
        if let Some(other) = &self.other_subset {
            write!(f, " -> [{other}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subset::Dim;
    use crate::symbolic::Expr;

    #[test]
    fn display_plain() {
        let m = Memlet::new("A", Range::from_indices(&[Expr::sym("i")]));
        assert_eq!(m.to_string(), "A[i]");
    }

    #[test]
    fn display_with_reducer_counts_written_elements() {
        let m = Memlet::new(
            "B",
            Range::new(vec![Dim::span(Expr::zero(), &Expr::int(5))]),
        )
        .with_wcr("sum");
        assert_eq!(m.to_string(), "B(5, sum)[0:5]");
    }

    #[test]
    fn empty_memlet() {
        assert!(Memlet::empty().is_empty());
        assert_eq!(Memlet::empty().to_string(), "[empty]");
    }
}
