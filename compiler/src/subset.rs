// subset.rs — Symbolic multi-dimensional index ranges
//
// A `Range` is an ordered list of `Dim`s, one per container dimension. Each
// dimension is an inclusive `[start, end]` interval with a positive step,
// all symbolic. Text form follows the exclusive-end convention of array
// slicing: `0:N, i, 0:M:2`.
//
// Preconditions: steps are positive.
// Postconditions: every operation returns canonical expressions.
// Failure modes: `Range::parse` returns `ExprParseError` on malformed text.
// Side effects: none.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::symbolic::{compare, Expr, ExprParseError};

// ── Dimension ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dim {
    pub start: Expr,
    /// Inclusive upper bound.
    pub end: Expr,
    pub step: Expr,
}

impl Dim {
    pub fn new(start: Expr, end: Expr, step: Expr) -> Self {
        Dim { start, end, step }
    }

    /// `start:stop` with an exclusive `stop` and unit step.
    pub fn span(start: Expr, stop: &Expr) -> Self {
        let end = Expr::sub(stop, &Expr::one());
        Dim {
            start,
            end,
            step: Expr::one(),
        }
    }

    /// A single index.
    pub fn index(at: Expr) -> Self {
        Dim {
            end: at.clone(),
            start: at,
            step: Expr::one(),
        }
    }

    /// Number of points: `(end - start) // step + 1`.
    pub fn size(&self) -> Expr {
        let extent = Expr::sub(&self.end, &self.start);
        Expr::add(&Expr::floordiv(&extent, &self.step), &Expr::one())
    }

    pub fn is_index(&self) -> bool {
        self.start == self.end
    }

    fn map_exprs(&self, f: impl Fn(&Expr) -> Expr) -> Dim {
        Dim {
            start: f(&self.start),
            end: f(&self.end),
            step: f(&self.step),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_index() {
            return write!(f, "{}", self.start);
        }
        let stop = Expr::add(&self.end, &Expr::one());
        write!(f, "{}:{}", self.start, stop)?;
        if !self.step.is_one() {
            write!(f, ":{}", self.step)?;
        }
        Ok(())
    }
}

// ── Range ───────────────────────────────────────────────────────────────────

/// A symbolic hyper-rectangle, possibly strided.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Range {
    pub dims: Vec<Dim>,
}

impl Range {
    pub fn new(dims: Vec<Dim>) -> Self {
        Range { dims }
    }

    /// The full extent of a container of the given shape.
    pub fn from_shape(shape: &[Expr]) -> Self {
        Range {
            dims: shape
                .iter()
                .map(|s| Dim::span(Expr::zero(), s))
                .collect(),
        }
    }

    /// One point per dimension.
    pub fn from_indices(indices: &[Expr]) -> Self {
        Range {
            dims: indices.iter().cloned().map(Dim::index).collect(),
        }
    }

    pub fn parse(text: &str) -> Result<Range, ExprParseError> {
        crate::parser::parse_range(text)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Per-dimension point counts.
    pub fn size(&self) -> Vec<Expr> {
        self.dims.iter().map(Dim::size).collect()
    }

    /// Total number of points.
    pub fn num_elements(&self) -> Expr {
        let sizes = self.size();
        Expr::product(sizes.iter())
    }

    pub fn min_element(&self) -> Vec<Expr> {
        self.dims.iter().map(|d| d.start.clone()).collect()
    }

    /// Shift every dimension by `by` (subtracted when `negative`).
    pub fn offset(&self, by: &[Expr], negative: bool) -> Range {
        let dims = self
            .dims
            .iter()
            .zip(by.iter().chain(std::iter::repeat(&Expr::Int(0))))
            .map(|(d, o)| {
                let shift = |e: &Expr| {
                    if negative {
                        Expr::sub(e, o)
                    } else {
                        Expr::add(e, o)
                    }
                };
                Dim {
                    start: shift(&d.start),
                    end: shift(&d.end),
                    step: d.step.clone(),
                }
            })
            .collect();
        Range { dims }
    }

    /// New range with `dims` placed before the existing dimensions.
    pub fn prepend(&self, dims: &[Dim]) -> Range {
        let mut all = dims.to_vec();
        all.extend(self.dims.iter().cloned());
        Range { dims: all }
    }

    /// Interpret `inner` relative to `self` (inner indices count from
    /// `self.start` in units of `self.step`). Ranks must match.
    pub fn compose(&self, inner: &Range) -> Option<Range> {
        if self.rank() != inner.rank() {
            return None;
        }
        let dims = self
            .dims
            .iter()
            .zip(&inner.dims)
            .map(|(outer, i)| Dim {
                start: Expr::add(&outer.start, &Expr::mul(&i.start, &outer.step)),
                end: Expr::add(&outer.start, &Expr::mul(&i.end, &outer.step)),
                step: Expr::mul(&i.step, &outer.step),
            })
            .collect();
        Some(Range { dims })
    }

    /// Whether `other` provably lies inside `self`. Unknown comparisons
    /// count as not covered.
    pub fn covers(&self, other: &Range) -> bool {
        if self.rank() != other.rank() {
            return false;
        }
        self.dims.iter().zip(&other.dims).all(|(a, b)| {
            let lo = matches!(
                compare(&a.start, &b.start),
                Some(Ordering::Less) | Some(Ordering::Equal)
            );
            let hi = matches!(
                compare(&b.end, &a.end),
                Some(Ordering::Less) | Some(Ordering::Equal)
            );
            lo && hi
        })
    }

    /// Drop unit-size dimensions, returning the indices of the kept ones.
    /// A range that would become empty keeps its last dimension.
    pub fn squeeze(&mut self) -> Vec<usize> {
        let kept: Vec<usize> = self
            .dims
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.size().is_one())
            .map(|(i, _)| i)
            .collect();
        if kept.is_empty() {
            if let Some(last) = self.dims.pop() {
                let index = self.dims.len();
                self.dims = vec![last];
                return vec![index];
            }
            return Vec::new();
        }
        self.dims = kept.iter().map(|&i| self.dims[i].clone()).collect();
        kept
    }

    /// Smallest range containing both, or `None` if the ranks differ.
    pub fn bounding_union(&self, other: &Range) -> Option<Range> {
        if self.rank() != other.rank() {
            return None;
        }
        let dims = self
            .dims
            .iter()
            .zip(&other.dims)
            .map(|(a, b)| Dim {
                start: Expr::min(&a.start, &b.start),
                end: Expr::max(&a.end, &b.end),
                step: if a.step == b.step {
                    a.step.clone()
                } else {
                    Expr::one()
                },
            })
            .collect();
        Some(Range { dims })
    }

    /// The region touched by `self` as `params` sweep over `space`.
    ///
    /// Subsets are assumed monotone in the parameters: starts take the
    /// lower bounds, ends take the upper bounds. A dimension that depends on
    /// a parameter loses its step.
    pub fn image(&self, params: &[String], space: &Range) -> Range {
        let mut lower = HashMap::new();
        let mut upper = HashMap::new();
        for (p, d) in params.iter().zip(&space.dims) {
            lower.insert(p.clone(), d.start.clone());
            upper.insert(p.clone(), d.end.clone());
        }
        let dims = self
            .dims
            .iter()
            .map(|d| {
                let depends = params.iter().any(|p| {
                    d.start.free_symbols().contains(p) || d.end.free_symbols().contains(p)
                });
                if !depends {
                    return d.clone();
                }
                Dim {
                    start: d.start.substitute(&lower),
                    end: d.end.substitute(&upper),
                    step: Expr::one(),
                }
            })
            .collect();
        Range { dims }
    }

    pub fn substitute(&self, map: &HashMap<String, Expr>) -> Range {
        Range {
            dims: self.dims.iter().map(|d| d.map_exprs(|e| e.substitute(map))).collect(),
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for d in &self.dims {
            out.extend(d.start.free_symbols());
            out.extend(d.end.free_symbols());
            out.extend(d.step.free_symbols());
        }
        out
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl From<Range> for String {
    fn from(r: Range) -> String {
        r.to_string()
    }
}

impl TryFrom<String> for Range {
    type Error = ExprParseError;

    fn try_from(text: String) -> Result<Range, ExprParseError> {
        Range::parse(&text)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn span(a: i64, b: i64) -> Dim {
        Dim::span(Expr::int(a), &Expr::int(b))
    }

    #[test]
    fn size_and_elements() {
        let r = Range::new(vec![span(0, 10), Dim::index(Expr::sym("i"))]);
        assert_eq!(r.size(), vec![Expr::int(10), Expr::int(1)]);
        assert_eq!(r.num_elements(), Expr::int(10));
        let strided = Range::new(vec![Dim::new(Expr::int(0), Expr::int(9), Expr::int(2))]);
        assert_eq!(strided.num_elements(), Expr::int(5));
    }

    #[test]
    fn display_uses_exclusive_end() {
        let n = Expr::sym("N");
        let r = Range::new(vec![
            Dim::span(Expr::zero(), &n),
            Dim::index(Expr::sym("i")),
            Dim::new(Expr::int(0), Expr::int(9), Expr::int(2)),
        ]);
        assert_eq!(r.to_string(), "0:N, i, 0:10:2");
    }

    #[test]
    fn offset_and_prepend() {
        let r = Range::from_indices(&[Expr::sym("i")]);
        let shifted = r.offset(&[Expr::int(2)], true);
        assert_eq!(shifted.to_string(), "i - 2");
        let p = shifted.prepend(&[span(0, 4)]);
        assert_eq!(p.to_string(), "0:4, i - 2");
    }

    #[test]
    fn covers_needs_proof() {
        let n = Expr::sym("N");
        let full = Range::from_shape(&[n.clone()]);
        let part = Range::new(vec![Dim::span(Expr::one(), &n)]);
        assert!(full.covers(&part));
        assert!(!part.covers(&full));
        let unknown = Range::new(vec![Dim::span(Expr::zero(), &Expr::sym("M"))]);
        assert!(!full.covers(&unknown));
    }

    #[test]
    fn squeeze_drops_unit_dims() {
        let mut r = Range::new(vec![Dim::index(Expr::int(0)), span(0, 5), Dim::index(Expr::int(3))]);
        let kept = r.squeeze();
        assert_eq!(kept, vec![1]);
        assert_eq!(r.to_string(), "0:5");
    }

    #[test]
    fn image_sweeps_parameters() {
        let r = Range::from_indices(&[Expr::sym("i"), Expr::int(0)]);
        let img = r.image(&["i".to_string()], &Range::new(vec![span(0, 10)]));
        assert_eq!(img.to_string(), "0:10, 0");
    }

    #[test]
    fn compose_relative_subset() {
        let outer = Range::new(vec![span(5, 15)]);
        let inner = Range::new(vec![span(0, 3)]);
        assert_eq!(outer.compose(&inner).map(|r| r.to_string()), Some("5:8".to_string()));
    }

    #[test]
    fn bounding_union_takes_extremes() {
        let a = Range::new(vec![span(0, 4)]);
        let b = Range::new(vec![span(2, 8)]);
        assert_eq!(a.bounding_union(&b).map(|r| r.to_string()), Some("0:8".to_string()));
    }
}
