//! Packed one- and two-electron integrals of the CI active space.
//!
//! One-electron integrals are stored as a lower triangle addressed by
//! [`index2`]; two-electron integrals (chemist notation) as a lower triangle
//! of lower-triangle pairs addressed by [`index4`].

use crate::cache::BlockMatrix;
use crate::engine::DpdContext;
use crate::moinfo::MOInfo;
use crate::mospace::SpaceId;
use crate::prelude::*;
use crate::store::{FileUnit, units};

pub const CI_OEI: &str = "CI OEI <X|X>";
pub const CI_TEI: &str = "CI TEI (XX|XX)";

/* #region packed addressing */

/// `ioff[i] = i (i + 1) / 2` for `i < n`.
pub fn ioff(n: usize) -> Vec<usize> {
    (0..n).map(|i| i * (i + 1) / 2).collect()
}

#[inline]
pub fn index2(i: usize, j: usize) -> usize {
    let (p, q) = if i > j { (i, j) } else { (j, i) };
    p * (p + 1) / 2 + q
}

#[inline]
pub fn index4(i: usize, j: usize, k: usize, l: usize) -> usize {
    index2(index2(i, j), index2(k, l))
}

fn ntri(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Drop `n_frozen_core` leading and `n_frozen_vir` trailing orbitals from a
/// packed one-electron array over `n_total` orbitals.
pub fn filter_onel(full: &[f64], n_total: usize, n_frozen_core: usize, n_frozen_vir: usize) -> Result<Vec<f64>> {
    if full.len() != ntri(n_total) {
        bail!("packed one-electron array has {} elements, expected {} for {n_total} orbitals", full.len(), ntri(n_total));
    }
    let Some(n_kept) = n_total.checked_sub(n_frozen_core + n_frozen_vir) else {
        bail!("cannot drop {n_frozen_core} core and {n_frozen_vir} virtual orbitals out of {n_total}");
    };
    let mut out = vec![0.0; ntri(n_kept)];
    for i in 0..n_kept {
        for j in 0..=i {
            out[index2(i, j)] = full[index2(i + n_frozen_core, j + n_frozen_core)];
        }
    }
    Ok(out)
}

/// Permute a packed one-electron array: element `(i, j)` moves to
/// `(reorder[i], reorder[j])`.
pub fn reorder_onel(full: &[f64], reorder: &[usize]) -> Result<Vec<f64>> {
    let n = reorder.len();
    if full.len() != ntri(n) {
        bail!("packed one-electron array has {} elements, expected {} for {n} orbitals", full.len(), ntri(n));
    }
    if !reorder.iter().sorted().copied().eq(0..n) {
        bail!("orbital reorder map {reorder:?} is not a permutation of 0..{n}");
    }
    let mut out = vec![0.0; full.len()];
    for i in 0..n {
        for j in i..n {
            out[index2(reorder[i], reorder[j])] = full[index2(i, j)];
        }
    }
    Ok(out)
}

/// Irrep block `dst_dim x dst_dim` of a full matrix, with rows and columns
/// gathered through `dst2src[dst_offset..]`.
pub fn get_mat_block(src: &BlockMatrix, dst_dim: usize, dst_offset: usize, dst2src: &[usize]) -> BlockMatrix {
    let map = &dst2src[dst_offset..dst_offset + dst_dim];
    let data = iproduct!(map, map).map(|(&p, &q)| src.get(p, q)).collect_vec();
    BlockMatrix::from_vec(dst_dim, dst_dim, data)
}

/// CI position of every MO (Pitzer order): frozen core orbitals first, then
/// the active orbitals grouped by irrep, then frozen virtuals.
pub fn default_ci_order(info: &MOInfo) -> Result<Vec<usize>> {
    let active = info.ci_active()?;
    let (n_core, n_active) = (info.frozen_docc().sum(), active.sum());
    let mut next = [0, n_core, n_core + n_active];
    let mut order = Vec::with_capacity(info.mopi().sum());
    for h in 0..info.nirrep() {
        let counts = [info.frozen_docc().count(h), active.count(h), info.frozen_uocc().count(h)];
        for (slot, count) in counts.into_iter().enumerate() {
            order.extend(next[slot]..next[slot] + count);
            next[slot] += count;
        }
    }
    Ok(order)
}

/* #endregion */

/* #region PackedIntegrals */

#[derive(Debug, Clone, PartialEq)]
pub struct PackedIntegrals {
    norb: usize,
    onel: Vec<f64>,
    twoel: Vec<f64>,
}

impl PackedIntegrals {
    pub fn new(norb: usize, onel: Vec<f64>, twoel: Vec<f64>) -> Result<Self> {
        let npair = ntri(norb);
        if onel.len() != npair {
            bail!("{} one-electron integrals given for {norb} orbitals, expected {npair}", onel.len());
        }
        if twoel.len() != ntri(npair) {
            bail!("{} two-electron integrals given for {norb} orbitals, expected {}", twoel.len(), ntri(npair));
        }
        Ok(Self { norb, onel, twoel })
    }

    /// Pack from functions of orbital indices; only `i >= j`, `k >= l`,
    /// `ij >= kl` are evaluated.
    pub fn from_fn(
        norb: usize,
        h: impl Fn(usize, usize) -> f64,
        g: impl Fn(usize, usize, usize, usize) -> f64,
    ) -> Self {
        let pairs = (0..norb).flat_map(|i| (0..=i).map(move |j| (i, j))).collect_vec();
        let onel = pairs.iter().map(|&(i, j)| h(i, j)).collect_vec();
        let mut twoel = Vec::with_capacity(ntri(pairs.len()));
        for (ij, &(i, j)) in pairs.iter().enumerate() {
            twoel.extend(pairs[..=ij].iter().map(|&(k, l)| g(i, j, k, l)));
        }
        Self { norb, onel, twoel }
    }

    pub fn norb(&self) -> usize {
        self.norb
    }

    pub fn onel(&self) -> &[f64] {
        &self.onel
    }

    pub fn twoel(&self) -> &[f64] {
        &self.twoel
    }

    pub fn get_onel(&self, i: usize, j: usize) -> f64 {
        self.onel[index2(i, j)]
    }

    pub fn get_twoel(&self, i: usize, j: usize, k: usize, l: usize) -> f64 {
        self.twoel[index4(i, j, k, l)]
    }

    /// `h'_ij = h_ij - 1/2 Σ_k (ik|kj)`, packed over `j <= i`.
    pub fn tf_onel_ints(&self) -> Vec<f64> {
        let n = self.norb;
        let mut out = Vec::with_capacity(self.onel.len());
        for i in 0..n {
            for j in 0..=i {
                let exchange: f64 = (0..n).map(|k| self.get_twoel(i, k, k, j)).sum();
                out.push(self.get_onel(i, j) - 0.5 * exchange);
            }
        }
        out
    }

    /// The `g` matrix restricting one-electron terms to ordered orbital
    /// strings (row-major, `norb x norb`).
    pub fn form_gmat(&self) -> BlockMatrix {
        let n = self.norb;
        let mut g = BlockMatrix::zeros(n, n);
        for (i, j) in iproduct!(0..n, 0..n) {
            let mut value = self.get_onel(i, j) - (0..i).map(|k| self.get_twoel(i, k, k, j)).sum::<f64>();
            if j <= i {
                let factor = if i == j { 0.5 } else { 1.0 };
                value -= factor * self.get_twoel(i, i, i, j);
            }
            *g.at_mut(i, j) = value;
        }
        g
    }

    /// Largest exchange integral `(ij|ij)` per orbital (not below zero) and
    /// overall.
    pub fn max_k(&self) -> (Vec<f64>, f64) {
        let n = self.norb;
        let max_k = (0..n).map(|i| (0..n).map(|j| self.get_twoel(i, j, i, j)).fold(0.0, f64::max)).collect_vec();
        let overall = max_k.iter().copied().fold(0.0, f64::max);
        (max_k, overall)
    }

    /// Store the packed arrays on `unit` as single-row records, in CI order
    /// and without symmetry blocking.
    pub fn write(&self, ctx: &DpdContext, unit: FileUnit) -> Result<()> {
        self.check_active_space(ctx)?;
        let store = ctx.store();
        store.write_block(unit, CI_OEI, 0, 0, 1, self.onel.len(), &self.onel)?;
        store.write_block(unit, CI_TEI, 0, 0, 1, self.twoel.len(), &self.twoel)
    }

    /// Read back what [`PackedIntegrals::write`] stored.
    pub fn read(ctx: &DpdContext, unit: FileUnit) -> Result<Self> {
        let norb = ctx.spaces().dim(SpaceId::Active)?.sum();
        if norb == 0 {
            return Self::new(0, vec![], vec![]);
        }
        let store = ctx.store();
        let read = |label: &str, len: usize| -> Result<Vec<f64>> {
            let shape = store.record_shape(unit, label, 0)?;
            if shape != (1, len) {
                bail!("'{label}' has shape {shape:?}, expected (1, {len}) for {norb} CI orbitals");
            }
            store.read_block(unit, label, 0, 0, 1)
        };
        let onel = read(CI_OEI, ntri(norb))?;
        let twoel = read(CI_TEI, ntri(ntri(norb)))?;
        Self::new(norb, onel, twoel)
    }

    /// Pack from engine tensors over the active space.
    pub fn from_engine(norb: usize, onel: &File2, twoel: &Buf4) -> Result<Self> {
        let (onel, twoel) = (onel.read()?, twoel.read_all()?);
        let pairs = (0..norb).flat_map(|i| (0..=i).map(move |j| (i, j))).collect_vec();
        let h = pairs.iter().map(|&(i, j)| onel.value(i, j)).collect_vec();
        let mut g = Vec::with_capacity(ntri(pairs.len()));
        for (ij, &(i, j)) in pairs.iter().enumerate() {
            for &(k, l) in &pairs[..=ij] {
                g.push(twoel.value(i, j, k, l));
            }
        }
        Self::new(norb, h, g)
    }

    fn check_active_space(&self, ctx: &DpdContext) -> Result<()> {
        let n_active = ctx.spaces().dim(SpaceId::Active)?.sum();
        if n_active != self.norb {
            bail!("{} CI orbitals do not match the {n_active}-orbital active space", self.norb);
        }
        Ok(())
    }
}

/* #endregion */

/// Build the CI integral set from dense MO integrals: reorder to CI order,
/// drop frozen orbitals, store on the CI unit and summarize.
pub fn build_ci_integrals(ctx: &DpdContext, info: &MOInfo, input: &CiInput) -> Result<CiIntegralSummary> {
    let nmo = info.mopi().sum();
    let onel = util::tensor_from_npy(&input.onel)?;
    let twoel = util::tensor_from_npy(&input.twoel)?;
    util::check_shape(&onel, &[nmo, nmo], "one-electron integrals")?;
    util::check_shape(&twoel, &[nmo; 4], "two-electron integrals")?;

    let order = match &input.order {
        Some(order) => order.clone(),
        None => default_ci_order(info)?,
    };
    let full = (0..nmo).flat_map(|i| (0..=i).map(move |j| (i, j))).map(|(i, j)| onel[[i, j]]).collect_vec();
    let reordered = reorder_onel(&full, &order)?;
    let (n_core, n_vir) = (info.frozen_docc().sum(), info.frozen_uocc().sum());
    let h = filter_onel(&reordered, nmo, n_core, n_vir)?;

    // MO index of every CI orbital
    let mut mo_of = vec![0; nmo];
    order.iter().enumerate().for_each(|(mo, &ci)| mo_of[ci] = mo);
    let norb = nmo - n_core - n_vir;
    let mo = |x: usize| mo_of[x + n_core];
    let packed_g = PackedIntegrals::from_fn(norb, |_, _| 0.0, |i, j, k, l| twoel[[mo(i), mo(j), mo(k), mo(l)]]);
    let ints = PackedIntegrals::new(norb, h, packed_g.twoel)?;

    ints.write(ctx, units::CI_INTS)?;
    let (max_k, max_k_overall) = ints.max_k();
    let tf_onel = ints.tf_onel_ints();
    let tf_onel_trace = (0..norb).map(|i| tf_onel[index2(i, i)]).sum();
    if log::log_enabled!(log::Level::Trace) {
        trace!("h' matrix: {tf_onel:?}");
        trace!("g matrix: {:?}", ints.form_gmat().as_slice());
    }
    for (i, k) in max_k.iter().enumerate() {
        debug!("maxK[{i}] = {k:.6}");
    }
    info!("CI integrals: {norb} orbitals, {} one-electron, {} two-electron", ints.onel().len(), ints.twoel().len());

    Ok(CiIntegralSummary {
        norb,
        n_onel: ints.onel().len(),
        n_twoel: ints.twoel().len(),
        max_k,
        max_k_overall,
        tf_onel_trace,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::MemoryBudget;
    use crate::irrep::Dimension;
    use crate::mospace::{MOSpace, SpaceRegistry};
    use crate::store::{BlockStore, OpenMode};
    use crate::util::unique_scratch_dir;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn sample(norb: usize) -> PackedIntegrals {
        PackedIntegrals::from_fn(
            norb,
            |i, j| -1.0 + 0.1 * (i + j) as f64,
            |i, j, k, l| {
                let (ij, kl) = (index2(i, j), index2(k, l));
                0.5 / (1.0 + (ij + kl) as f64) + 0.01 * (ij * kl) as f64
            },
        )
    }

    #[test]
    fn test_packed_addressing() {
        assert_eq!(ioff(5), vec![0, 1, 3, 6, 10]);
        assert_eq!(index2(3, 1), 7);
        assert_eq!(index2(1, 3), 7);
        assert_eq!(index4(1, 0, 0, 0), 1);
        assert_eq!(index4(1, 1, 1, 0), index2(2, 1));
    }

    proptest! {
        #[test]
        fn index4_has_eightfold_symmetry(i in 0usize..9, j in 0usize..9, k in 0usize..9, l in 0usize..9) {
            let ijkl = index4(i, j, k, l);
            for other in [index4(j, i, k, l), index4(i, j, l, k), index4(k, l, i, j), index4(l, k, j, i)] {
                prop_assert_eq!(ijkl, other);
            }
        }
    }

    #[test]
    fn test_tf_onel_two_orbitals() {
        let ints = sample(2);
        let tf = ints.tf_onel_ints();
        // h'_10 = h_10 - 1/2 [(10|00) + (11|10)]
        let expected = ints.get_onel(1, 0) - 0.5 * (ints.get_twoel(1, 0, 0, 0) + ints.get_twoel(1, 1, 1, 0));
        assert_abs_diff_eq!(tf[1], expected, epsilon = 1e-14);
        let expected = ints.get_onel(0, 0) - 0.5 * (ints.get_twoel(0, 0, 0, 0) + ints.get_twoel(0, 1, 1, 0));
        assert_abs_diff_eq!(tf[0], expected, epsilon = 1e-14);
    }

    #[test]
    fn test_gmat() {
        let ints = sample(3);
        let g = ints.form_gmat();
        // upper triangle: only the k < i sum
        assert_abs_diff_eq!(g.get(0, 2), ints.get_onel(0, 2), epsilon = 1e-14);
        assert_abs_diff_eq!(g.get(1, 2), ints.get_onel(1, 2) - ints.get_twoel(1, 0, 0, 2), epsilon = 1e-14);
        // diagonal: half of (ii|ii)
        let expected = ints.get_onel(2, 2) - ints.get_twoel(2, 0, 0, 2) - ints.get_twoel(2, 1, 1, 2) - 0.5 * ints.get_twoel(2, 2, 2, 2);
        assert_abs_diff_eq!(g.get(2, 2), expected, epsilon = 1e-14);
        // lower triangle: full (ii|ij)
        let expected = ints.get_onel(2, 0) - ints.get_twoel(2, 0, 0, 0) - ints.get_twoel(2, 1, 1, 0) - ints.get_twoel(2, 2, 2, 0);
        assert_abs_diff_eq!(g.get(2, 0), expected, epsilon = 1e-14);
    }

    #[test]
    fn test_max_k() {
        let g = |i: usize, j: usize, k: usize, l: usize| if (i, j) == (k, l) || (i, j) == (l, k) { (i + 2 * j) as f64 - 3.0 } else { 0.0 };
        let ints = PackedIntegrals::from_fn(3, |_, _| 0.0, g);
        let (max_k, overall) = ints.max_k();
        // (ij|ij) = max(i, j) + 2 min(i, j) - 3, floored at zero
        assert_eq!(max_k, vec![0.0, 1.0, 3.0]);
        assert_eq!(overall, 3.0);
    }

    #[test]
    fn test_filter_and_reorder_onel() {
        let full = (0..10).map(|x| x as f64).collect_vec();
        // orbitals 1, 2 of four
        assert_eq!(filter_onel(&full, 4, 1, 1).unwrap(), vec![full[2], full[4], full[5]]);
        assert!(filter_onel(&full, 4, 3, 2).is_err());
        assert!(filter_onel(&full[..9], 4, 0, 0).is_err());

        let swapped = reorder_onel(&full, &[1, 0, 2, 3]).unwrap();
        assert_eq!(swapped[index2(1, 1)], full[index2(0, 0)]);
        assert_eq!(swapped[index2(3, 0)], full[index2(3, 1)]);
        assert!(reorder_onel(&full, &[0, 0, 1, 2]).is_err());
    }

    #[test]
    fn test_get_mat_block() {
        let src = BlockMatrix::from_vec(3, 3, (0..9).map(|x| x as f64).collect());
        let block = get_mat_block(&src, 2, 1, &[0, 2, 1]);
        assert_eq!(block.as_slice(), &[8.0, 7.0, 5.0, 4.0]);
    }

    #[test]
    fn test_default_ci_order() {
        let layout = crate::moinfo::OrbitalLayout {
            mopi: vec![3, 2],
            docc: Some(vec![2, 1]),
            frozen_docc: Some(vec![1, 0]),
            frozen_uocc: Some(vec![0, 1]),
            ..Default::default()
        };
        let info = layout.resolve().unwrap();
        assert_eq!(default_ci_order(&info).unwrap(), vec![0, 1, 2, 3, 4]);

        let layout = crate::moinfo::OrbitalLayout { frozen_docc: Some(vec![1, 1]), ..layout };
        let info = layout.resolve().unwrap();
        assert_eq!(default_ci_order(&info).unwrap(), vec![0, 2, 3, 1, 4]);
    }

    #[test]
    fn test_engine_roundtrip() {
        let spaces = SpaceRegistry::from_spaces(
            2,
            [MOSpace::with_default_tags(SpaceId::Active, Dimension::new(vec![2, 1]).unwrap())],
        )
        .unwrap();
        let store = BlockStore::new(unique_scratch_dir("ci-ints"), "dpd").unwrap();
        let ctx = DpdContext::new(spaces, store, MemoryBudget::new(1 << 16));
        ctx.store().open(units::CI_INTS, OpenMode::Create).unwrap();

        // orbitals 0, 1 in irrep 0 and 2 in irrep 1; zero where symmetry forbids
        let sym = |p: usize| usize::from(p == 2);
        let ints = PackedIntegrals::from_fn(
            3,
            |i, j| if sym(i) == sym(j) { 0.3 * (i + j + 1) as f64 } else { 0.0 },
            |i, j, k, l| if sym(i) ^ sym(j) == sym(k) ^ sym(l) { 1.0 / (1 + i + 2 * j + 3 * k + 4 * l) as f64 } else { 0.0 },
        );
        ints.write(&ctx, units::CI_INTS).unwrap();
        let back = PackedIntegrals::read(&ctx, units::CI_INTS).unwrap();
        assert_eq!(back, ints);

        let h = ctx.file2(units::CI_INTS, 0, 'X', 'X', "H <X|X>").unwrap();
        h.write_from_fn(|i, j| ints.get_onel(i, j)).unwrap();
        let g = ctx.buf4_plain(units::CI_INTS, 0, "[X>=X]+", "[X>=X]+", "G (XX|XX)").unwrap();
        g.write_from_fn(|i, j, k, l| ints.get_twoel(i, j, k, l)).unwrap();
        assert_eq!(PackedIntegrals::from_engine(3, &h, &g).unwrap(), ints);

        let wrong = sample(2);
        assert!(wrong.write(&ctx, units::CI_INTS).is_err());
        ctx.store().close(units::CI_INTS, false).unwrap();
        std::fs::remove_dir_all(ctx.store().dir()).unwrap();
    }

    #[test]
    fn test_storage_keeps_ci_order() {
        // CI orbitals need not be grouped by irrep, so nothing may be dropped
        // as symmetry-forbidden on the way through the store
        let spaces = SpaceRegistry::from_spaces(
            2,
            [MOSpace::with_default_tags(SpaceId::Active, Dimension::new(vec![2, 1]).unwrap())],
        )
        .unwrap();
        let store = BlockStore::new(unique_scratch_dir("ci-ints-order"), "dpd").unwrap();
        let ctx = DpdContext::new(spaces, store, MemoryBudget::new(1 << 16));
        ctx.store().open(units::CI_INTS, OpenMode::Create).unwrap();

        let ints = sample(3);
        assert!(ints.get_onel(2, 0) != 0.0 && ints.get_twoel(2, 0, 0, 0) != 0.0);
        ints.write(&ctx, units::CI_INTS).unwrap();
        assert_eq!(PackedIntegrals::read(&ctx, units::CI_INTS).unwrap(), ints);
        ctx.store().close(units::CI_INTS, false).unwrap();
        std::fs::remove_dir_all(ctx.store().dir()).unwrap();
    }
}
