// symbolic.rs — Symbolic integer expressions
//
// Canonical symbolic arithmetic over program symbols and scope parameters:
// shapes, strides, subset bounds and iteration ranges are all `Expr`s.
// Sums and products are kept as a sum-of-monomials normal form, so two
// expressions that differ only by reassociation or constant folding compare
// equal (`N - 1 + 1 == N`). Floor division, modulo, `min` and `max` fold when
// their operands allow it and are otherwise kept as opaque atoms.
//
// Preconditions: composite expressions are built through the smart
//                constructors (`add`, `mul`, `floordiv`, ...), never by
//                assembling `Add`/`Mul` variants by hand.
// Postconditions: every constructor returns the canonical form.
// Failure modes: `Expr::parse` returns `ExprParseError` on malformed text.
// Side effects: none.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Expression ──────────────────────────────────────────────────────────────

/// A symbolic integer expression in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Expr {
    Int(i64),
    Sym(String),
    /// Sum of at least two terms; non-constant terms first, constant last.
    Add(Vec<Expr>),
    /// Product of at least two factors; an integer coefficient, if any, first.
    Mul(Vec<Expr>),
    FloorDiv(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse expression '{text}': {message}")]
pub struct ExprParseError {
    pub text: String,
    pub message: String,
}

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::Int(value)
    }

    pub fn sym(name: impl Into<String>) -> Expr {
        Expr::Sym(name.into())
    }

    pub fn zero() -> Expr {
        Expr::Int(0)
    }

    pub fn one() -> Expr {
        Expr::Int(1)
    }

    /// Parse canonical (or any well-formed) expression text.
    pub fn parse(text: &str) -> Result<Expr, ExprParseError> {
        crate::parser::parse_expr(text)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_int() == Some(0)
    }

    pub fn is_one(&self) -> bool {
        self.as_int() == Some(1)
    }

    // ── Smart constructors ──────────────────────────────────────────────

    pub fn add(a: &Expr, b: &Expr) -> Expr {
        let mut p = poly_of(a);
        poly_add(&mut p, poly_of(b), 1);
        expr_of(p)
    }

    pub fn sub(a: &Expr, b: &Expr) -> Expr {
        let mut p = poly_of(a);
        poly_add(&mut p, poly_of(b), -1);
        expr_of(p)
    }

    pub fn mul(a: &Expr, b: &Expr) -> Expr {
        expr_of(poly_mul(&poly_of(a), &poly_of(b)))
    }

    pub fn neg(a: &Expr) -> Expr {
        Expr::sub(&Expr::zero(), a)
    }

    /// Sum of an arbitrary number of expressions.
    pub fn sum<'a>(terms: impl IntoIterator<Item = &'a Expr>) -> Expr {
        let mut p = Poly::new();
        for t in terms {
            poly_add(&mut p, poly_of(t), 1);
        }
        expr_of(p)
    }

    /// Product of an arbitrary number of expressions (1 when empty).
    pub fn product<'a>(factors: impl IntoIterator<Item = &'a Expr>) -> Expr {
        let mut p = poly_of(&Expr::one());
        for f in factors {
            p = poly_mul(&p, &poly_of(f));
        }
        expr_of(p)
    }

    pub fn floordiv(a: &Expr, b: &Expr) -> Expr {
        if b.is_one() || a.is_zero() {
            return if a.is_zero() { Expr::zero() } else { a.clone() };
        }
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            if y != 0 {
                return Expr::Int(floor_div(x, y));
            }
        }
        if let Some(y) = b.as_int() {
            if y != 0 {
                let p = poly_of(a);
                if p.values().all(|c| c % y == 0) {
                    return expr_of(p.into_iter().map(|(m, c)| (m, c / y)).collect());
                }
            }
        }
        if a == b {
            return Expr::one();
        }
        Expr::FloorDiv(Box::new(a.clone()), Box::new(b.clone()))
    }

    pub fn modulo(a: &Expr, b: &Expr) -> Expr {
        if b.is_one() || a.is_zero() {
            return Expr::zero();
        }
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            if y != 0 {
                return Expr::Int(x - y * floor_div(x, y));
            }
        }
        Expr::Mod(Box::new(a.clone()), Box::new(b.clone()))
    }

    pub fn min(a: &Expr, b: &Expr) -> Expr {
        match compare(a, b) {
            Some(Ordering::Less) | Some(Ordering::Equal) => a.clone(),
            Some(Ordering::Greater) => b.clone(),
            None => {
                let (x, y) = if a <= b { (a, b) } else { (b, a) };
                Expr::Min(Box::new(x.clone()), Box::new(y.clone()))
            }
        }
    }

    pub fn max(a: &Expr, b: &Expr) -> Expr {
        match compare(a, b) {
            Some(Ordering::Greater) | Some(Ordering::Equal) => a.clone(),
            Some(Ordering::Less) => b.clone(),
            None => {
                let (x, y) = if a <= b { (a, b) } else { (b, a) };
                Expr::Max(Box::new(x.clone()), Box::new(y.clone()))
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Int(_) => {}
            Expr::Sym(name) => {
                out.insert(name.clone());
            }
            Expr::Add(items) | Expr::Mul(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
            Expr::FloorDiv(a, b) | Expr::Mod(a, b) | Expr::Min(a, b) | Expr::Max(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }

    /// Replace symbols by expressions, re-canonicalising on the way up.
    pub fn substitute(&self, map: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Int(_) => self.clone(),
            Expr::Sym(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            Expr::Add(items) => {
                let subs: Vec<Expr> = items.iter().map(|i| i.substitute(map)).collect();
                Expr::sum(subs.iter())
            }
            Expr::Mul(items) => {
                let subs: Vec<Expr> = items.iter().map(|i| i.substitute(map)).collect();
                Expr::product(subs.iter())
            }
            Expr::FloorDiv(a, b) => Expr::floordiv(&a.substitute(map), &b.substitute(map)),
            Expr::Mod(a, b) => Expr::modulo(&a.substitute(map), &b.substitute(map)),
            Expr::Min(a, b) => Expr::min(&a.substitute(map), &b.substitute(map)),
            Expr::Max(a, b) => Expr::max(&a.substitute(map), &b.substitute(map)),
        }
    }

    /// Substitute a single symbol.
    pub fn substitute_one(&self, name: &str, value: &Expr) -> Expr {
        let mut map = HashMap::new();
        map.insert(name.to_string(), value.clone());
        self.substitute(&map)
    }

    /// Whether this node prints without surrounding parentheses in a product.
    fn is_atomic(&self) -> bool {
        matches!(
            self,
            Expr::Int(_) | Expr::Sym(_) | Expr::Min(..) | Expr::Max(..)
        ) && !matches!(self, Expr::Int(v) if *v < 0)
    }

    /// Split a term into (is_negative, magnitude) for sum printing.
    fn split_sign(&self) -> (bool, Expr) {
        match self {
            Expr::Int(v) if *v < 0 => (true, Expr::Int(-v)),
            Expr::Mul(items) => match items.first().and_then(Expr::as_int) {
                Some(c) if c < 0 => {
                    let mut rest = items.clone();
                    if c == -1 {
                        rest.remove(0);
                    } else {
                        rest[0] = Expr::Int(-c);
                    }
                    let magnitude = if rest.len() == 1 {
                        rest.remove(0)
                    } else {
                        Expr::Mul(rest)
                    };
                    (true, magnitude)
                }
                _ => (false, self.clone()),
            },
            _ => (false, self.clone()),
        }
    }
}

/// Compare two expressions when their difference is a known constant.
pub fn compare(a: &Expr, b: &Expr) -> Option<Ordering> {
    Expr::sub(a, b).as_int().map(|d| d.cmp(&0))
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

// ── Polynomial normal form ──────────────────────────────────────────────────

/// Product of atoms with multiplicities, sorted by atom.
type Monomial = Vec<(Expr, u32)>;
/// Map from monomial to non-zero integer coefficient.
type Poly = BTreeMap<Monomial, i64>;

fn poly_of(e: &Expr) -> Poly {
    let mut p = Poly::new();
    match e {
        Expr::Int(0) => {}
        Expr::Int(v) => {
            p.insert(Vec::new(), *v);
        }
        Expr::Add(items) => {
            for item in items {
                poly_add(&mut p, poly_of(item), 1);
            }
        }
        Expr::Mul(items) => {
            p.insert(Vec::new(), 1);
            for item in items {
                p = poly_mul(&p, &poly_of(item));
            }
        }
        atom => {
            p.insert(vec![(atom.clone(), 1)], 1);
        }
    }
    p
}

fn poly_add(acc: &mut Poly, other: Poly, sign: i64) {
    for (mono, coeff) in other {
        let entry = acc.entry(mono).or_insert(0);
        *entry += sign * coeff;
    }
    acc.retain(|_, c| *c != 0);
}

fn poly_mul(a: &Poly, b: &Poly) -> Poly {
    let mut out = Poly::new();
    for (ma, ca) in a {
        for (mb, cb) in b {
            let entry = out.entry(mono_mul(ma, mb)).or_insert(0);
            *entry += ca * cb;
        }
    }
    out.retain(|_, c| *c != 0);
    out
}

fn mono_mul(a: &Monomial, b: &Monomial) -> Monomial {
    let mut merged: BTreeMap<Expr, u32> = BTreeMap::new();
    for (atom, pow) in a.iter().chain(b.iter()) {
        *merged.entry(atom.clone()).or_insert(0) += pow;
    }
    merged.into_iter().collect()
}

fn degree(mono: &Monomial) -> u32 {
    mono.iter().map(|(_, p)| p).sum()
}

fn expr_of(p: Poly) -> Expr {
    let mut terms: Vec<(Monomial, i64)> = p.into_iter().filter(|(_, c)| *c != 0).collect();
    if terms.is_empty() {
        return Expr::Int(0);
    }
    terms.sort_by(|(ma, _), (mb, _)| match (ma.is_empty(), mb.is_empty()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => degree(mb).cmp(&degree(ma)).then_with(|| ma.cmp(mb)),
    });
    let mut exprs: Vec<Expr> = terms
        .into_iter()
        .map(|(mono, coeff)| term_of(mono, coeff))
        .collect();
    if exprs.len() == 1 {
        exprs.remove(0)
    } else {
        Expr::Add(exprs)
    }
}

fn term_of(mono: Monomial, coeff: i64) -> Expr {
    if mono.is_empty() {
        return Expr::Int(coeff);
    }
    let mut factors = Vec::new();
    if coeff != 1 {
        factors.push(Expr::Int(coeff));
    }
    for (atom, pow) in mono {
        for _ in 0..pow {
            factors.push(atom.clone());
        }
    }
    if factors.len() == 1 {
        factors.remove(0)
    } else {
        Expr::Mul(factors)
    }
}

// ── Display / conversions ───────────────────────────────────────────────────

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Sym(name) => write!(f, "{name}"),
            Expr::Add(items) => {
                for (i, item) in items.iter().enumerate() {
                    let (negative, magnitude) = item.split_sign();
                    match (i, negative) {
                        (0, false) => write!(f, "{magnitude}")?,
                        (0, true) => write!(f, "-{}", paren_if_sum(&magnitude))?,
                        (_, false) => write!(f, " + {magnitude}")?,
                        (_, true) => write!(f, " - {magnitude}")?,
                    }
                }
                Ok(())
            }
            Expr::Mul(items) => {
                let mut first = true;
                for (i, item) in items.iter().enumerate() {
                    if i == 0 && item.as_int() == Some(-1) {
                        write!(f, "-")?;
                        continue;
                    }
                    if !first {
                        write!(f, "*")?;
                    }
                    first = false;
                    if item.is_atomic() || (i == 0 && item.as_int().is_some()) {
                        write!(f, "{item}")?;
                    } else {
                        write!(f, "({item})")?;
                    }
                }
                Ok(())
            }
            Expr::FloorDiv(a, b) => write!(f, "{} // {}", operand(a), operand(b)),
            Expr::Mod(a, b) => write!(f, "{} % {}", operand(a), operand(b)),
            Expr::Min(a, b) => write!(f, "min({a}, {b})"),
            Expr::Max(a, b) => write!(f, "max({a}, {b})"),
        }
    }
}

fn paren_if_sum(e: &Expr) -> String {
    match e {
        Expr::Add(_) => format!("({e})"),
        _ => e.to_string(),
    }
}

fn operand(e: &Expr) -> String {
    if e.is_atomic() {
        e.to_string()
    } else {
        format!("({e})")
    }
}

impl From<Expr> for String {
    fn from(e: Expr) -> String {
        e.to_string()
    }
}

impl TryFrom<String> for Expr {
    type Error = ExprParseError;

    fn try_from(text: String) -> Result<Expr, ExprParseError> {
        Expr::parse(&text)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Expr {
        Expr::Int(v)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Expr {
        Expr::Sym(name.to_string())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
