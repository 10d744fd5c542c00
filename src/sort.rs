//! Index permutations of symmetry-blocked tensors.

use crate::cache::{BlockMatrix, MemoryBudget};
use crate::descriptor::PairIndex;
use crate::engine::Buf4;
use crate::irrep::{Dimension, Irrep, compose};
use crate::prelude::*;
use crate::store::FileUnit;
use std::sync::Arc;

/* #region 4-index sort */

/// Output index order of a 4-index sort, as positions of the input indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort4 {
    order: [usize; 4],
}

impl Sort4 {
    /// Parse a permutation of `pqrs`; `"rspq"` puts input `(p,q,r,s)` at
    /// output `(r,s,p,q)`.
    pub fn parse(order: &str) -> Result<Self> {
        let letters = order.chars().collect_vec();
        if letters.len() != 4 {
            bail!("sort order '{order}' must have four letters");
        }
        let mut positions = [0; 4];
        for (k, c) in letters.iter().enumerate() {
            positions[k] = match c {
                'p' => 0,
                'q' => 1,
                'r' => 2,
                's' => 3,
                _ => bail!("sort order '{order}' contains '{c}'"),
            };
        }
        if !positions.iter().all_unique() {
            bail!("sort order '{order}' is not a permutation of pqrs");
        }
        Ok(Self { order: positions })
    }

    /// Output indices from input indices.
    pub fn apply<T: Copy>(&self, input: [T; 4]) -> [T; 4] {
        self.order.map(|k| input[k])
    }

    /// Input indices from output indices.
    pub fn invert<T: Copy>(&self, output: [T; 4]) -> [T; 4] {
        let mut input = output;
        for (k, &pos) in self.order.iter().enumerate() {
            input[pos] = output[k];
        }
        input
    }

    pub fn inverse(&self) -> Self {
        Self { order: self.invert([0, 1, 2, 3]) }
    }
}

/// Permute the indices of `input` into a new tensor on `out_file` with
/// composite layout `out` and the same overall irrep.
///
/// Packed input layouts are read through their addressing signs; every
/// output slot receives exactly one input element.
pub fn buf4_sort<'a>(input: &Buf4<'a>, out_file: FileUnit, order: &str, out: (&str, &str), label: &str) -> Result<Buf4<'a>> {
    let sort = Sort4::parse(order)?;
    let ctx = input.ctx();
    let output = ctx.buf4_plain(out_file, input.sym(), out.0, out.1, label)?;

    let in_spaces = {
        let (r, c) = (input.row_index().spec(), input.col_index().spec());
        [r.p, r.q, c.p, c.q]
    };
    let out_spaces = {
        let (r, c) = (output.row_index().spec(), output.col_index().spec());
        [r.p, r.q, c.p, c.q]
    };
    assert_eq!(
        sort.apply(in_spaces),
        out_spaces,
        "[fatal] sort '{order}' of '{}' cannot produce layout {},{}",
        input.label(),
        out.0,
        out.1
    );

    let (in_row, in_col) = (input.row_index(), input.col_index());
    for h in 0..output.nirrep() {
        let hc = compose(h, output.sym());
        // input irreps feeding output irrep h, loaded on first use
        let mut sources: Vec<Option<BlockMatrix>> = (0..input.nirrep()).map(|_| None).collect();
        for (start, count) in output.bucket_plan(h, 0).buckets() {
            let mut block = output.alloc_rows(h, count);
            for m in 0..count {
                let [p, q] = output.row_index().pair(h, start + m);
                for n in 0..block.cols() {
                    let [r, s] = output.col_index().pair(hc, n);
                    let idx = sort.invert([p, q, r, s]);
                    let (Some(row), Some(col)) = (in_row.lookup(idx[0], idx[1]), in_col.lookup(idx[2], idx[3])) else {
                        continue;
                    };
                    if col.irrep != compose(row.irrep, input.sym()) {
                        continue;
                    }
                    if sources[row.irrep].is_none() {
                        sources[row.irrep] = Some(input.read_irrep(row.irrep)?);
                    }
                    if let Some(source) = &sources[row.irrep] {
                        *block.at_mut(m, n) = row.sign * col.sign * source.get(row.index, col.index);
                    }
                }
            }
            output.write_rows(h, start, &block)?;
        }
    }
    debug!("sorted '{}' ({order}) into '{label}'", input.label());
    Ok(output)
}

/* #endregion */

/* #region 3-index triple blocks */

/// Output index order of a 3-index permutation, in input letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perm3 {
    Abc,
    Acb,
    Bac,
    Bca,
    Cab,
    Cba,
}

impl Perm3 {
    fn order(self) -> [usize; 3] {
        match self {
            Perm3::Abc => [0, 1, 2],
            Perm3::Acb => [0, 2, 1],
            Perm3::Bac => [1, 0, 2],
            Perm3::Bca => [1, 2, 0],
            Perm3::Cab => [2, 0, 1],
            Perm3::Cba => [2, 1, 0],
        }
    }
}

/// `W[Gab][ab][c]` for one occupied triple of irrep `Gijk`.
#[derive(Debug)]
pub struct TripleBlock {
    gijk: Irrep,
    pairs: Arc<PairIndex>,
    blocks: Vec<BlockMatrix>,
}

impl TripleBlock {
    /// Zero block over the unpacked virtual pair index `pairs`.
    pub fn new(memory: &Arc<MemoryBudget>, pairs: Arc<PairIndex>, gijk: Irrep) -> Self {
        assert!(
            pairs.p_dim() == pairs.q_dim(),
            "[fatal] triple blocks need a pair index over one space, got {}",
            pairs.spec()
        );
        let blocks = (0..pairs.nirrep())
            .map(|gab| memory.zeros(pairs.tot(gab), pairs.q_dim().count(compose(gab, gijk))))
            .collect();
        Self { gijk, pairs, blocks }
    }

    pub fn gijk(&self) -> Irrep {
        self.gijk
    }

    pub fn pairs(&self) -> &PairIndex {
        &self.pairs
    }

    pub fn vir(&self) -> &Dimension {
        self.pairs.q_dim()
    }

    pub fn nirrep(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, gab: Irrep) -> &BlockMatrix {
        &self.blocks[gab]
    }

    pub fn block_mut(&mut self, gab: Irrep) -> &mut BlockMatrix {
        &mut self.blocks[gab]
    }

    /// Element at absolute virtual indices; zero outside the triple's irrep.
    pub fn get(&self, a: usize, b: usize, c: usize) -> f64 {
        let Some(slot) = self.pairs.lookup(a, b) else {
            return 0.0;
        };
        let (gc, c_rel) = self.vir().relative(c);
        if gc != compose(slot.irrep, self.gijk) {
            return 0.0;
        }
        self.blocks[slot.irrep].get(slot.index, c_rel)
    }

    pub fn zero(&mut self) {
        self.blocks.iter_mut().for_each(|b| b.as_mut_slice().fill(0.0));
    }

    pub fn scale(&mut self, alpha: f64) {
        self.blocks.iter_mut().for_each(|b| b.scale(alpha));
    }

    pub fn dot(&self, other: &TripleBlock) -> f64 {
        izip!(&self.blocks, &other.blocks).map(|(x, y)| x.dot(y)).sum()
    }

    /// Apply `f(a, b, c, value)` in place over every element.
    pub fn map_inplace(&mut self, mut f: impl FnMut(usize, usize, usize, f64) -> f64) {
        let vir = self.pairs.q_dim().clone();
        for gab in 0..self.blocks.len() {
            let gc = compose(gab, self.gijk);
            let offset = vir.offset(gc);
            for m in 0..self.blocks[gab].rows() {
                let [a, b] = self.pairs.pair(gab, m);
                for (c, x) in self.blocks[gab].row_mut(m).iter_mut().enumerate() {
                    *x = f(a, b, offset + c, *x);
                }
            }
        }
    }
}

/// Permute the three virtual indices of `win` into `wout`.
///
/// `Perm3::Cab` means `Wout[ca][b] (+)= Win[ab][c]`; `accumulate = false`
/// overwrites `wout`.
pub fn sort_3d(win: &TripleBlock, wout: &mut TripleBlock, perm: Perm3, accumulate: bool) {
    assert!(
        win.gijk == wout.gijk && win.pairs.spec() == wout.pairs.spec(),
        "[fatal] sort_3d between triple blocks of different shape"
    );
    if !accumulate {
        wout.zero();
    }
    let order = perm.order();
    let vir = win.vir();
    for gab in 0..win.nirrep() {
        let gc = compose(gab, win.gijk);
        let offset = vir.offset(gc);
        let block = &win.blocks[gab];
        for m in 0..block.rows() {
            let [a, b] = win.pairs.pair(gab, m);
            for (c, &value) in block.row(m).iter().enumerate() {
                let abc = [a, b, offset + c];
                let [x, y, z] = order.map(|k| abc[k]);
                let Some(slot) = wout.pairs.lookup(x, y) else {
                    continue;
                };
                let z_rel = z - vir.offset(compose(slot.irrep, wout.gijk));
                *wout.blocks[slot.irrep].at_mut(slot.index, z_rel) += slot.sign * value;
            }
        }
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::MemoryBudget;
    use crate::descriptor::PairSpec;
    use crate::engine::DpdContext;
    use crate::mospace::{MOSpace, SpaceId, SpaceRegistry};
    use crate::store::{BlockStore, OpenMode, units};
    use crate::util::unique_scratch_dir;
    use itertools::iproduct;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn context(tag: &str) -> DpdContext {
        context_with_budget(tag, 1 << 20)
    }

    fn context_with_budget(tag: &str, budget: usize) -> DpdContext {
        let occ = MOSpace::with_default_tags(SpaceId::AlphaOcc, Dimension::new(vec![2, 0, 1, 1]).unwrap());
        let vir = MOSpace::with_default_tags(SpaceId::AlphaVir, Dimension::new(vec![2, 1, 0, 2]).unwrap());
        let spaces = SpaceRegistry::from_spaces(4, [occ, vir]).unwrap();
        let store = BlockStore::new(unique_scratch_dir(tag), "dpd").unwrap();
        let ctx = DpdContext::new(spaces, store, MemoryBudget::new(budget));
        ctx.store().open(units::AMPLITUDES, OpenMode::Create).unwrap();
        ctx
    }

    fn cleanup(ctx: DpdContext) {
        ctx.store().close(units::AMPLITUDES, false).unwrap();
        std::fs::remove_dir_all(ctx.store().dir()).unwrap();
    }

    #[test]
    fn test_sort4_parse() {
        let sort = Sort4::parse("rspq").unwrap();
        assert_eq!(sort.apply([1, 2, 3, 4]), [3, 4, 1, 2]);
        let sort = Sort4::parse("srqp").unwrap();
        assert_eq!(sort.apply([1, 2, 3, 4]), [4, 3, 2, 1]);
        let sort = Sort4::parse("qrsp").unwrap();
        assert_eq!(sort.invert(sort.apply([5, 6, 7, 8])), [5, 6, 7, 8]);
        assert_eq!(sort.inverse().apply(sort.apply([5, 6, 7, 8])), [5, 6, 7, 8]);
        let spaces = [SpaceId::AlphaOcc, SpaceId::AlphaVir, SpaceId::AlphaVir, SpaceId::AlphaVir];
        assert_eq!(Sort4::parse("rspq").unwrap().apply(spaces)[2], SpaceId::AlphaOcc);
        assert!(Sort4::parse("pqrr").is_err());
        assert!(Sort4::parse("pqr").is_err());
        assert!(Sort4::parse("pqrx").is_err());
    }

    #[test]
    fn test_sort_and_inverse_restore_tensor() {
        let ctx = context("sort-inverse");
        let mut rng = StdRng::seed_from_u64(7);
        let values: Vec<f64> = (0..4 * 5 * 5 * 5).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let dense = |i: usize, a: usize, b: usize, c: usize| values[((i * 5 + a) * 5 + b) * 5 + c];

        let x = ctx.buf4_plain(units::AMPLITUDES, 1, "[O,V]", "[V,V]", "X").unwrap();
        x.write_from_fn(dense).unwrap();
        let y = buf4_sort(&x, units::AMPLITUDES, "rspq", ("[V,V]", "[O,V]"), "X (rspq)").unwrap();
        let z = buf4_sort(&y, units::AMPLITUDES, "rspq", ("[O,V]", "[V,V]"), "X back").unwrap();

        let occ = ctx.spaces().get(SpaceId::AlphaOcc).unwrap().orbsym().to_vec();
        let vir = ctx.spaces().get(SpaceId::AlphaVir).unwrap().orbsym().to_vec();
        for (i, a, b, c) in iproduct!(0..4, 0..5, 0..5, 0..5) {
            let allowed = occ[i] ^ vir[a] ^ vir[b] ^ vir[c] == 1;
            let expected = if allowed { dense(i, a, b, c) } else { 0.0 };
            assert_eq!(y.value(b, c, i, a).unwrap(), expected);
            assert_eq!(z.value(i, a, b, c).unwrap(), expected);
        }
        assert_eq!(x.dot(&z).unwrap(), x.dot(&x).unwrap());
        cleanup(ctx);
    }

    #[test]
    fn test_sort_with_small_budget() {
        let sorted = |ctx: &DpdContext| {
            let x = ctx.buf4_plain(units::AMPLITUDES, 0, "[O,V]", "[V,V]", "X").unwrap();
            x.write_from_fn(|i, a, b, c| (i * 125 + a * 25 + b * 5 + c) as f64 - 100.0).unwrap();
            let y = buf4_sort(&x, units::AMPLITUDES, "rspq", ("[V,V]", "[O,V]"), "X (rspq)").unwrap();
            assert_eq!(ctx.memory().used(), 0);
            iproduct!(0..5, 0..5, 0..4, 0..5).map(|(b, c, i, a)| y.value(b, c, i, a).unwrap()).collect_vec()
        };
        let (big, small) = (context("sort-big"), context_with_budget("sort-small", 30));
        // irrep 0 of [V,V] has 9 rows of width 6 and must be split
        let y = small.buf4_plain(units::AMPLITUDES, 0, "[V,V]", "[O,V]", "Y").unwrap();
        assert!(y.bucket_plan(0, 0).n_buckets >= 2);
        let (whole, tiled) = (sorted(&big), sorted(&small));
        assert!(whole.iter().any(|&v| v != 0.0));
        assert_eq!(whole, tiled);
        cleanup(big);
        cleanup(small);
    }

    #[test]
    fn test_sort_from_packed_layout() {
        let ctx = context("sort-packed");
        // <VO||OO> stored antisymmetric in the last pair
        let f = |a: usize, i: usize, j: usize, k: usize| (a * 64 + i * 16 + j * 4 + k) as f64 * if j > k { 1.0 } else { -1.0 };
        let x = ctx.buf4_plain(units::AMPLITUDES, 0, "[V,O]", "[O>O]-", "VOOO").unwrap();
        x.write_from_fn(f).unwrap();
        let y = buf4_sort(&x, units::AMPLITUDES, "srqp", ("[O,O]", "[O,V]"), "OOOV").unwrap();
        assert_eq!(x.value(2, 0, 3, 2).unwrap(), 142.0);
        assert_eq!(y.value(2, 3, 0, 2).unwrap(), 142.0);
        assert_eq!(y.value(3, 2, 0, 2).unwrap(), -142.0);
        assert_eq!(y.value(2, 2, 0, 2).unwrap(), 0.0);
        cleanup(ctx);
    }

    #[test]
    fn test_sort_3d_permutations() {
        let memory = Arc::new(MemoryBudget::new(1 << 16));
        let vir = Dimension::new(vec![2, 1, 0, 2]).unwrap();
        let pairs = Arc::new(PairIndex::from_dims(PairSpec::unpacked(SpaceId::AlphaVir, SpaceId::AlphaVir), vir.clone(), vir));
        let mut win = TripleBlock::new(&memory, pairs.clone(), 3);
        win.map_inplace(|a, b, c, _| (a * 25 + b * 5 + c) as f64 + 1.0);

        let mut w1 = TripleBlock::new(&memory, pairs.clone(), 3);
        let mut w2 = TripleBlock::new(&memory, pairs.clone(), 3);
        let mut w3 = TripleBlock::new(&memory, pairs.clone(), 3);
        sort_3d(&win, &mut w1, Perm3::Cab, false);
        for (a, b, c) in iproduct!(0..5, 0..5, 0..5) {
            assert_eq!(w1.get(c, a, b), win.get(a, b, c));
        }
        // cab applied three times is the identity
        sort_3d(&w1, &mut w2, Perm3::Cab, false);
        sort_3d(&w2, &mut w3, Perm3::Cab, false);
        assert_eq!(w3.dot(&win), win.dot(&win));
        assert_eq!(w3.get(4, 0, 3), win.get(4, 0, 3));

        // acb is an involution and accumulates
        sort_3d(&win, &mut w1, Perm3::Acb, false);
        let mut acc = TripleBlock::new(&memory, pairs.clone(), 3);
        sort_3d(&win, &mut acc, Perm3::Abc, false);
        sort_3d(&w1, &mut acc, Perm3::Acb, true);
        for (a, b, c) in iproduct!(0..5, 0..5, 0..5) {
            assert_eq!(acc.get(a, b, c), 2.0 * win.get(a, b, c));
            assert_eq!(w1.get(a, c, b), win.get(a, b, c));
        }
    }
}
