//! Irrep bookkeeping for abelian point groups.
//!
//! Irreps are numbered `0..nirrep` with the totally symmetric irrep at `0`.
//! For the abelian groups D2h and its subgroups the direct product of two
//! irreps is the bitwise XOR of their indices.

use crate::prelude::*;

pub type Irrep = usize;

/// Direct product of two irreps.
#[inline]
pub fn compose(p: Irrep, q: Irrep) -> Irrep {
    p ^ q
}

/// Irrep counts of the abelian point groups (C1 up to D2h).
pub fn is_valid_nirrep(nirrep: usize) -> bool {
    matches!(nirrep, 1 | 2 | 4 | 8)
}

/* #region Dimension */

/// Per-irrep orbital counts, with cumulative offsets in Pitzer order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dimension {
    counts: Vec<usize>,
    offsets: Vec<usize>,
}

impl Dimension {
    pub fn new(counts: Vec<usize>) -> Result<Self> {
        if !is_valid_nirrep(counts.len()) {
            bail!("number of irreps must be 1, 2, 4 or 8, got {} ({:?})", counts.len(), counts);
        }
        let offsets = counts
            .iter()
            .scan(0, |acc, &n| {
                let off = *acc;
                *acc += n;
                Some(off)
            })
            .collect();
        Ok(Self { counts, offsets })
    }

    /// Build from counts as they appear in user input; negative counts are rejected.
    pub fn from_signed(counts: &[i64]) -> Result<Self> {
        let counts = counts
            .iter()
            .enumerate()
            .map(|(h, &n)| match usize::try_from(n) {
                Ok(n) => Ok(n),
                Err(_) => Err(format_err!("negative orbital count {n} in irrep {h}")),
            })
            .collect::<Result<Vec<usize>>>()?;
        Self::new(counts)
    }

    pub fn zeros(nirrep: usize) -> Result<Self> {
        Self::new(vec![0; nirrep])
    }

    pub fn nirrep(&self) -> usize {
        self.counts.len()
    }

    pub fn count(&self, h: Irrep) -> usize {
        self.counts[h]
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn offset(&self, h: Irrep) -> usize {
        self.offsets[h]
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn sum(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Irrep of every orbital, flattening the counts in irrep order.
    pub fn orbsym(&self) -> Vec<Irrep> {
        self.counts.iter().enumerate().flat_map(|(h, &n)| std::iter::repeat_n(h, n)).collect()
    }

    /// Irrep and index within the irrep of absolute orbital `p`.
    pub fn relative(&self, p: usize) -> (Irrep, usize) {
        let h = self.irrep_of(p);
        (h, p - self.offsets[h])
    }

    pub fn irrep_of(&self, p: usize) -> Irrep {
        assert!(p < self.sum(), "[fatal] orbital {p} outside of a space with {} orbitals", self.sum());
        (0..self.nirrep()).find(|&h| self.offsets[h] <= p && p < self.offsets[h] + self.counts[h]).unwrap_or(0)
    }

    pub fn absolute(&self, h: Irrep, i: usize) -> usize {
        self.offsets[h] + i
    }

    pub fn checked_add(&self, other: &Dimension) -> Result<Dimension> {
        if self.nirrep() != other.nirrep() {
            bail!("cannot add dimensions with {} and {} irreps", self.nirrep(), other.nirrep());
        }
        Dimension::new(izip!(&self.counts, &other.counts).map(|(a, b)| a + b).collect())
    }

    pub fn checked_sub(&self, other: &Dimension) -> Result<Dimension> {
        if self.nirrep() != other.nirrep() {
            bail!("cannot subtract dimensions with {} and {} irreps", self.nirrep(), other.nirrep());
        }
        let counts = izip!(0.., &self.counts, &other.counts)
            .map(|(h, &a, &b)| match a.checked_sub(b) {
                Some(n) => Ok(n),
                None => Err(format_err!("inconsistent orbital counts in irrep {h}: {b} exceeds {a}")),
            })
            .collect::<Result<Vec<usize>>>()?;
        Dimension::new(counts)
    }
}

/* #endregion */

/* #region irrep labels */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrrepLabels {
    labels: Vec<String>,
}

impl IrrepLabels {
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if !is_valid_nirrep(labels.len()) {
            bail!("number of irrep labels must be 1, 2, 4 or 8, got {}", labels.len());
        }
        Ok(Self { labels })
    }

    /// Labels `1`, `2`, ... for callers that do not name their irreps.
    pub fn numbered(nirrep: usize) -> Result<Self> {
        Self::new((1..=nirrep).map(|h| h.to_string()).collect())
    }

    pub fn nirrep(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, h: Irrep) -> &str {
        &self.labels[h]
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Resolve a wavefunction symmetry from an irrep label (case and padding
    /// insensitive) or a 1-based irrep number. Unmatched input selects irrep 0.
    pub fn resolve(&self, wfn_sym: &str) -> Irrep {
        let target = wfn_sym.trim().to_lowercase();
        let mut sym = 0;
        for (h, label) in self.labels.iter().enumerate() {
            if target == label.trim().to_lowercase() {
                sym = h;
            }
            if target == (h + 1).to_string() {
                sym = h;
            }
        }
        sym
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn compose_forms_abelian_group(k in 0u32..4, p in 0usize..8, q in 0usize..8, r in 0usize..8) {
            let n = 1usize << k;
            let (p, q, r) = (p % n, q % n, r % n);
            prop_assert!(compose(p, q) < n);
            prop_assert_eq!(compose(p, q), compose(q, p));
            prop_assert_eq!(compose(compose(p, q), r), compose(p, compose(q, r)));
            prop_assert_eq!(compose(p, 0), p);
            prop_assert_eq!(compose(p, p), 0);
        }

        #[test]
        fn orbsym_matches_offsets(counts in proptest::collection::vec(0usize..5, 4)) {
            let dim = Dimension::new(counts.clone()).unwrap();
            let orbsym = dim.orbsym();
            prop_assert_eq!(orbsym.len(), dim.sum());
            for (p, &h) in orbsym.iter().enumerate() {
                prop_assert_eq!(dim.irrep_of(p), h);
                let (hp, i) = dim.relative(p);
                prop_assert_eq!(hp, h);
                prop_assert_eq!(dim.absolute(h, i), p);
            }
        }
    }

    #[test]
    fn test_dimension_rejects_bad_input() {
        assert!(Dimension::from_signed(&[2, -1, 0, 1]).is_err());
        assert!(Dimension::new(vec![1, 2, 3]).is_err());
        let dim = Dimension::from_signed(&[3, 0, 1, 2]).unwrap();
        assert_eq!(dim.offsets(), &[0, 3, 3, 4]);
        assert_eq!(dim.orbsym(), vec![0, 0, 0, 2, 3, 3]);

        let occ = Dimension::new(vec![2, 0, 1, 1]).unwrap();
        assert_eq!(dim.checked_sub(&occ).unwrap().counts(), &[1, 0, 0, 1]);
        assert!(occ.checked_sub(&dim).is_err());
    }

    #[test]
    fn test_resolve_wfn_sym() {
        let labels = IrrepLabels::new(["Ag ", "B1g", "B2g", "B3g", "Au ", "B1u", "B2u", "B3u"].map(String::from).to_vec())
            .unwrap();
        assert_eq!(labels.resolve("b1u"), 5);
        assert_eq!(labels.resolve(" AU"), 4);
        assert_eq!(labels.resolve("3"), 2);
        assert_eq!(labels.resolve("E'"), 0);
    }
}
