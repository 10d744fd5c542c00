//! Block descriptors: composite-index tables and per-irrep extents.
//!
//! A composite index couples two orbital indices `(p, q)` into one row (or
//! column) index of a symmetry-blocked tensor. Within irrep `h` the pairs
//! with `irrep(p) ^ irrep(q) == h` are enumerated in a fixed order; the
//! descriptor is the only place where these orders and offsets are computed.

use crate::irrep::{Dimension, Irrep, compose};
use crate::mospace::{SpaceId, SpaceRegistry};
use crate::prelude::*;
use std::sync::Arc;

const NO_SLOT: usize = usize::MAX;

/* #region PairSpec */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Packing {
    /// All ordered pairs `(p, q)`.
    Unpacked,
    /// Pairs with `p >= q`; `(q, p)` maps onto `(p, q)`.
    Symmetric,
    /// Pairs with `p > q`; `(q, p)` maps onto `(p, q)` with a sign flip, `(p, p)` is zero.
    Antisymmetric,
}

/// Definition of a composite index, e.g. `[O,V]`, `[A>=A]+` or `[O>O]-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairSpec {
    pub p: SpaceId,
    pub q: SpaceId,
    pub packing: Packing,
}

impl PairSpec {
    pub fn unpacked(p: SpaceId, q: SpaceId) -> Self {
        Self { p, q, packing: Packing::Unpacked }
    }

    pub fn symmetric(p: SpaceId) -> Self {
        Self { p, q: p, packing: Packing::Symmetric }
    }

    pub fn antisymmetric(p: SpaceId) -> Self {
        Self { p, q: p, packing: Packing::Antisymmetric }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || format_err!("malformed composite index '{spec}'");
        let s = spec.trim();
        let inner_end = s.find(']').ok_or_else(bad)?;
        let inner = s.strip_prefix('[').ok_or_else(bad)?;
        let inner = &inner[..inner_end - 1];
        let suffix = &s[inner_end + 1..];

        let (lhs, op, rhs) = if let Some((l, r)) = inner.split_once(">=") {
            (l, ">=", r)
        } else if let Some((l, r)) = inner.split_once('>') {
            (l, ">", r)
        } else if let Some((l, r)) = inner.split_once(',') {
            (l, ",", r)
        } else {
            return Err(bad());
        };
        let single = |x: &str| -> Result<SpaceId> {
            let mut chars = x.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => SpaceId::from_label(c),
                _ => Err(bad()),
            }
        };
        let (p, q) = (single(lhs)?, single(rhs)?);

        let packing = match (op, suffix) {
            (",", "") => Packing::Unpacked,
            (">=", "+") => Packing::Symmetric,
            (">", "-") => Packing::Antisymmetric,
            _ => return Err(bad()),
        };
        if packing != Packing::Unpacked && p != q {
            bail!("packed composite index '{spec}' must pair a space with itself");
        }
        Ok(Self { p, q, packing })
    }
}

impl std::str::FromStr for PairSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for PairSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (p, q) = (self.p.label(), self.q.label());
        match self.packing {
            Packing::Unpacked => write!(f, "[{p},{q}]"),
            Packing::Symmetric => write!(f, "[{p}>={q}]+"),
            Packing::Antisymmetric => write!(f, "[{p}>{q}]-"),
        }
    }
}

/* #endregion */

/* #region PairIndex */

/// Storage position of an orbital pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSlot {
    pub irrep: Irrep,
    pub index: usize,
    pub sign: f64,
}

#[derive(Debug, Clone)]
pub struct PairIndex {
    spec: PairSpec,
    p_dim: Dimension,
    q_dim: Dimension,
    p_sym: Vec<Irrep>,
    q_sym: Vec<Irrep>,
    /// orbital pair of every slot, per irrep
    orb: Vec<Vec<[usize; 2]>>,
    /// `p * nq + q` to slot within its irrep
    idx: Vec<usize>,
    /// start of the stacked `(Gp, h ^ Gp)` sub-block in irrep `h`; unpacked only
    sub_offset: Vec<Vec<usize>>,
}

impl PairIndex {
    pub fn new(spec: PairSpec, registry: &SpaceRegistry) -> Result<Self> {
        let p_dim = registry.dim(spec.p)?.clone();
        let q_dim = registry.dim(spec.q)?.clone();
        Ok(Self::from_dims(spec, p_dim, q_dim))
    }

    pub fn from_dims(spec: PairSpec, p_dim: Dimension, q_dim: Dimension) -> Self {
        let nirrep = p_dim.nirrep();
        let (np, nq) = (p_dim.sum(), q_dim.sum());
        let p_sym = p_dim.orbsym();
        let q_sym = q_dim.orbsym();
        let mut orb = vec![vec![]; nirrep];
        let mut idx = vec![NO_SLOT; np * nq];
        let mut sub_offset = vec![vec![0; nirrep]; nirrep];

        let mut push = |p: usize, q: usize, orb: &mut Vec<Vec<[usize; 2]>>| {
            let h = compose(p_sym[p], q_sym[q]);
            idx[p * nq + q] = orb[h].len();
            orb[h].push([p, q]);
        };

        match spec.packing {
            Packing::Unpacked => {
                for h in 0..nirrep {
                    for gp in 0..nirrep {
                        let gq = compose(h, gp);
                        sub_offset[h][gp] = orb[h].len();
                        for (i, j) in (0..p_dim.count(gp)).cartesian_product(0..q_dim.count(gq)) {
                            push(p_dim.absolute(gp, i), q_dim.absolute(gq, j), &mut orb);
                        }
                    }
                }
            },
            Packing::Symmetric => {
                for p in 0..np {
                    for q in 0..=p {
                        push(p, q, &mut orb);
                    }
                }
            },
            Packing::Antisymmetric => {
                for p in 0..np {
                    for q in 0..p {
                        push(p, q, &mut orb);
                    }
                }
            },
        }

        Self { spec, p_dim, q_dim, p_sym, q_sym, orb, idx, sub_offset }
    }

    pub fn spec(&self) -> PairSpec {
        self.spec
    }

    pub fn packing(&self) -> Packing {
        self.spec.packing
    }

    pub fn nirrep(&self) -> usize {
        self.orb.len()
    }

    pub fn p_dim(&self) -> &Dimension {
        &self.p_dim
    }

    pub fn q_dim(&self) -> &Dimension {
        &self.q_dim
    }

    /// Number of pairs in irrep `h`.
    pub fn tot(&self, h: Irrep) -> usize {
        self.orb[h].len()
    }

    pub fn pairs(&self, h: Irrep) -> &[[usize; 2]] {
        &self.orb[h]
    }

    pub fn pair(&self, h: Irrep, slot: usize) -> [usize; 2] {
        self.orb[h][slot]
    }

    /// Storage position of `(p, q)`; `None` for the diagonal of an antisymmetric pair.
    pub fn lookup(&self, p: usize, q: usize) -> Option<PairSlot> {
        let (p, q, sign) = match self.spec.packing {
            Packing::Unpacked => (p, q, 1.0),
            Packing::Symmetric => (p.max(q), p.min(q), 1.0),
            Packing::Antisymmetric if p == q => return None,
            Packing::Antisymmetric if p > q => (p, q, 1.0),
            Packing::Antisymmetric => (q, p, -1.0),
        };
        let nq = self.q_sym.len();
        match self.idx[p * nq + q] {
            NO_SLOT => None,
            index => Some(PairSlot { irrep: compose(self.p_sym[p], self.q_sym[q]), index, sign }),
        }
    }

    /// Start of the sub-block with `irrep(p) == gp` inside irrep `h`.
    pub fn sub_block_offset(&self, h: Irrep, gp: Irrep) -> usize {
        assert!(
            self.spec.packing == Packing::Unpacked,
            "[fatal] sub-block offsets requested for packed composite index {}",
            self.spec
        );
        self.sub_offset[h][gp]
    }

    /// Slot of the first pair `(p, q)` with the given `p` inside irrep `h`;
    /// the pairs sharing `p` follow contiguously.
    pub fn first_pair_offset(&self, h: Irrep, p: usize) -> usize {
        let (gp, i) = self.p_dim.relative(p);
        self.sub_block_offset(h, gp) + i * self.q_dim.count(compose(h, gp))
    }
}

/* #endregion */

/* #region tensor descriptors */

/// Extents of a 4-index tensor: row composite, column composite and overall irrep.
#[derive(Debug, Clone)]
pub struct Buf4Params {
    pub row: Arc<PairIndex>,
    pub col: Arc<PairIndex>,
    pub sym: Irrep,
}

impl Buf4Params {
    pub fn nirrep(&self) -> usize {
        self.row.nirrep()
    }

    pub fn rowtot(&self, h: Irrep) -> usize {
        self.row.tot(h)
    }

    /// Columns paired with row irrep `h`.
    pub fn coltot(&self, h: Irrep) -> usize {
        self.col.tot(compose(h, self.sym))
    }

    pub fn same_layout(&self, other: &Buf4Params) -> bool {
        self.row.spec() == other.row.spec() && self.col.spec() == other.col.spec() && self.sym == other.sym
    }
}

/// Extents of a 2-index tensor.
#[derive(Debug, Clone)]
pub struct File2Params {
    pub row: SpaceId,
    pub col: SpaceId,
    pub row_dim: Dimension,
    pub col_dim: Dimension,
    pub sym: Irrep,
}

impl File2Params {
    pub fn nirrep(&self) -> usize {
        self.row_dim.nirrep()
    }

    pub fn rowtot(&self, h: Irrep) -> usize {
        self.row_dim.count(h)
    }

    pub fn coltot(&self, h: Irrep) -> usize {
        self.col_dim.count(compose(h, self.sym))
    }
}

/* #endregion */
