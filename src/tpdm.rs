//! Back-transformation of the unrestricted MO-basis two-particle density
//! matrix to the SO basis.
//!
//! Both halves stream row buckets of the packed input, transform the column
//! pair with the MO coefficients and write packed SO columns:
//!
//! ```text
//! (AA|AA) + (AA|aa) -> (AA|nn) -rspq-> (nn|AA) \
//!                                               +-> (nn|nn)
//! (aa|aa)           -> (aa|nn) -rspq-> (nn|aa) /
//! ```

use crate::cache::{MatMut, MatRef};
use crate::contract::gemm;
use crate::engine::DpdContext;
use crate::mospace::SpaceId;
use crate::prelude::*;
use crate::sort::buf4_sort;
use crate::store::{OpenMode, units};
use std::path::Path;

pub const MO_TPDM_AA: &str = "MO TPDM (AA|AA)";
pub const MO_TPDM_AB: &str = "MO TPDM (AA|aa)";
pub const MO_TPDM_BB: &str = "MO TPDM (aa|aa)";
pub const SO_TPDM: &str = "SO Basis TPDM (nn|nn)";

/* #region inputs */

/// Store the three packed MO TPDM pieces on the presort unit. Each function
/// takes absolute MO indices `(p, q, r, s)` with `p >= q` and `r >= s`.
pub fn write_mo_tpdm(
    ctx: &DpdContext,
    aa: impl Fn(usize, usize, usize, usize) -> f64,
    ab: impl Fn(usize, usize, usize, usize) -> f64,
    bb: impl Fn(usize, usize, usize, usize) -> f64,
) -> Result<()> {
    ctx.buf4_plain(units::TPDM_PRESORT, 0, "[A>=A]+", "[A>=A]+", MO_TPDM_AA)?.write_from_fn(aa)?;
    ctx.buf4_plain(units::TPDM_PRESORT, 0, "[A>=A]+", "[a>=a]+", MO_TPDM_AB)?.write_from_fn(ab)?;
    ctx.buf4_plain(units::TPDM_PRESORT, 0, "[a>=a]+", "[a>=a]+", MO_TPDM_BB)?.write_from_fn(bb)?;
    Ok(())
}

/// Store the MO coefficients `C <n|A>` and `C <n|a>` (rows SO, columns MO)
/// on the presort unit.
pub fn write_mo_coefficients(
    ctx: &DpdContext,
    c_alpha: impl Fn(usize, usize) -> f64,
    c_beta: impl Fn(usize, usize) -> f64,
) -> Result<()> {
    ctx.file2(units::TPDM_PRESORT, 0, 'n', 'A', "C <n|A>")?.write_from_fn(c_alpha)?;
    ctx.file2(units::TPDM_PRESORT, 0, 'n', 'a', "C <n|a>")?.write_from_fn(c_beta)?;
    Ok(())
}

/// Load the dense `.npy` TPDM pieces and coefficients onto the presort unit.
pub fn load_tpdm_inputs(ctx: &DpdContext, input: &TpdmInput) -> Result<()> {
    let nmo = ctx.spaces().dim(SpaceId::AlphaMo)?.sum();
    let nso = ctx.spaces().dim(SpaceId::So)?.sum();
    let load = |path: &Path, shape: &[usize], what: &str| -> Result<Tsr> {
        let tensor = util::tensor_from_npy(path)?;
        util::check_shape(&tensor, shape, what)?;
        Ok(tensor)
    };
    let aa = load(&input.tpdm_aa, &[nmo; 4], "MO TPDM (AA|AA)")?;
    let ab = load(&input.tpdm_ab, &[nmo; 4], "MO TPDM (AA|aa)")?;
    let bb = load(&input.tpdm_bb, &[nmo; 4], "MO TPDM (aa|aa)")?;
    let ca = load(&input.c_alpha, &[nso, nmo], "alpha MO coefficients")?;
    let cb = load(&input.c_beta, &[nso, nmo], "beta MO coefficients")?;

    write_mo_tpdm(
        ctx,
        |p, q, r, s| aa[[p, q, r, s]],
        |p, q, r, s| ab[[p, q, r, s]],
        |p, q, r, s| bb[[p, q, r, s]],
    )?;
    write_mo_coefficients(ctx, |m, p| ca[[m, p]], |m, p| cb[[m, p]])
}

/* #endregion */

/* #region back-transformation */

/// `out(pq, mn) = Σ_i Σ_rs C_i(m, r) in_i(pq, rs) C_i(n, s)`.
///
/// Inputs are read with unpacked MO columns, the output is written with
/// unpacked SO columns; all share the row layout of `out`.
fn half_transform(sources: &[(&Buf4, &File2Blocks)], out: &Buf4, print: usize) -> Result<()> {
    let ctx = out.ctx();
    let device = ctx.device();
    let Some(&(first, _)) = sources.first() else {
        return Ok(());
    };

    let max_block = |f: fn(&BlockMatrix) -> usize| {
        sources.iter().flat_map(|(_, c)| (0..c.nirrep()).map(move |h| f(c.block(h)))).max().unwrap_or(0)
    };
    let mut tmp = vec![0.0; max_block(BlockMatrix::cols) * max_block(BlockMatrix::rows)];

    for h in 0..out.nirrep() {
        let plan = first.bucket_plan(h, out.coltot(h));
        if print > 1 {
            debug!("h = {h}; rows_per_bucket = {}", plan.rows_per_bucket);
            debug!("h = {h}; nbuckets        = {}", plan.n_buckets);
        }
        for (start, count) in plan.buckets() {
            let mut k = out.alloc_rows(h, count);
            for (n, &(j, c)) in sources.iter().enumerate() {
                let block = j.read_rows(h, start, count)?;
                let beta = if n == 0 { 0.0 } else { 1.0 };
                for pq in 0..count {
                    for gr in 0..out.nirrep() {
                        let gs = compose(h, gr);
                        let (c_r, c_s) = (c.block(gr), c.block(gs));
                        let (mo_r, mo_s, so_r, so_s) = (c_r.cols(), c_s.cols(), c_r.rows(), c_s.rows());
                        if so_r == 0 || so_s == 0 {
                            continue;
                        }
                        // TMP = J_seg C_s^T
                        let rs = j.col_index().sub_block_offset(h, gr);
                        let j_seg = MatRef::new(&block.row(pq)[rs..], mo_r, mo_s);
                        gemm(device, false, true, 1.0, j_seg, c_s.mat(), 0.0, MatMut::new(&mut tmp, mo_r, so_s));
                        // K_seg (+)= C_r TMP
                        let mn = out.col_index().sub_block_offset(h, gr);
                        let k_seg = MatMut::new(&mut k.row_mut(pq)[mn..], so_r, so_s);
                        gemm(device, false, false, 1.0, c_r.mat(), MatRef::new(&tmp, mo_r, so_s), beta, k_seg);
                    }
                }
            }
            out.write_rows(h, start, &k)?;
        }
    }
    Ok(())
}

/// Back-transform the MO TPDM on the presort unit (which must be open) to
/// `SO Basis TPDM (nn|nn)` on the SO TPDM unit.
///
/// The presort and half-transformed units are closed with their keep flags;
/// the SO TPDM unit is closed and kept.
pub fn backtransform_tpdm_unrestricted(ctx: &DpdContext, config: &DpdConfig) -> Result<()> {
    let timer = std::time::Instant::now();
    let ca = ctx.file2(units::TPDM_PRESORT, 0, 'n', 'A', "C <n|A>")?.read()?;
    let cb = ctx.file2(units::TPDM_PRESORT, 0, 'n', 'a', "C <n|a>")?.read()?;

    info!("Starting first half-transformation.");
    ctx.store().open(units::TPDM_HALFTRANS, OpenMode::Create)?;
    {
        let j1 = ctx.buf4(units::TPDM_PRESORT, 0, ("[A>=A]+", "[A,A]"), ("[A>=A]+", "[A>=A]+"), false, MO_TPDM_AA)?;
        let j2 = ctx.buf4(units::TPDM_PRESORT, 0, ("[A>=A]+", "[a,a]"), ("[A>=A]+", "[a>=a]+"), false, MO_TPDM_AB)?;
        let k = ctx.buf4(
            units::TPDM_HALFTRANS,
            0,
            ("[A>=A]+", "[n,n]"),
            ("[A>=A]+", "[n>=n]+"),
            false,
            "Half-Transformed TPDM (AA|nn)",
        )?;
        half_transform(&[(&j1, &ca), (&j2, &cb)], &k, config.print)?;

        let j1 = ctx.buf4(units::TPDM_PRESORT, 0, ("[a>=a]+", "[a,a]"), ("[a>=a]+", "[a>=a]+"), false, MO_TPDM_BB)?;
        let k = ctx.buf4(
            units::TPDM_HALFTRANS,
            0,
            ("[a>=a]+", "[n,n]"),
            ("[a>=a]+", "[n>=n]+"),
            false,
            "Half-Transformed TPDM (aa|nn)",
        )?;
        half_transform(&[(&j1, &cb)], &k, config.print)?;
    }
    ctx.store().close(units::TPDM_PRESORT, config.keep_presort)?;

    info!("Sorting half-transformed TPDMs.");
    let k = ctx.buf4_plain(units::TPDM_HALFTRANS, 0, "[A>=A]+", "[n>=n]+", "Half-Transformed TPDM (AA|nn)")?;
    buf4_sort(&k, units::TPDM_HALFTRANS, "rspq", ("[n>=n]+", "[A>=A]+"), "Half-Transformed TPDM (nn|AA)")?;
    let k = ctx.buf4_plain(units::TPDM_HALFTRANS, 0, "[a>=a]+", "[n>=n]+", "Half-Transformed TPDM (aa|nn)")?;
    buf4_sort(&k, units::TPDM_HALFTRANS, "rspq", ("[n>=n]+", "[a>=a]+"), "Half-Transformed TPDM (nn|aa)")?;
    info!("First half integral transformation complete.");

    ctx.store().open(units::SO_TPDM, OpenMode::Create)?;
    {
        let j1 = ctx.buf4(
            units::TPDM_HALFTRANS,
            0,
            ("[n>=n]+", "[A,A]"),
            ("[n>=n]+", "[A>=A]+"),
            false,
            "Half-Transformed TPDM (nn|AA)",
        )?;
        let j2 = ctx.buf4(
            units::TPDM_HALFTRANS,
            0,
            ("[n>=n]+", "[a,a]"),
            ("[n>=n]+", "[a>=a]+"),
            false,
            "Half-Transformed TPDM (nn|aa)",
        )?;
        let k = ctx.buf4(units::SO_TPDM, 0, ("[n>=n]+", "[n,n]"), ("[n>=n]+", "[n>=n]+"), false, SO_TPDM)?;
        half_transform(&[(&j1, &ca), (&j2, &cb)], &k, config.print)?;
    }
    ctx.store().close(units::TPDM_HALFTRANS, config.keep_halftrans)?;
    ctx.store().close(units::SO_TPDM, true)?;

    info!("Second half integral transformation complete.");
    info!("Time elapsed (TPDM back-transformation): {:?}", timer.elapsed());
    Ok(())
}

/// Reopen the kept SO TPDM unit, summarize it and optionally dump it as a
/// dense `[nso; 4]` array.
pub fn so_tpdm_summary(ctx: &DpdContext, dump: Option<&Path>) -> Result<TpdmResults> {
    ctx.store().open(units::SO_TPDM, OpenMode::Existing)?;
    let gamma = ctx.buf4_plain(units::SO_TPDM, 0, "[n>=n]+", "[n>=n]+", SO_TPDM)?;
    let nso = ctx.spaces().dim(SpaceId::So)?.sum();

    let norm_sq = gamma.dot(&gamma)?;
    // Γ_mmnn lives in the totally symmetric block: diagonal rows against diagonal columns
    let diagonal = |index: &PairIndex| index.pairs(0).iter().positions(|&[p, q]| p == q).collect_vec();
    let (rows, cols) = (diagonal(gamma.row_index()), diagonal(gamma.col_index()));
    let mut trace = 0.0;
    for (start, count) in gamma.bucket_plan(0, 0).buckets() {
        let block = gamma.read_rows(0, start, count)?;
        for &m in rows.iter().filter(|&&m| (start..start + count).contains(&m)) {
            let row = block.row(m - start);
            trace += cols.iter().map(|&n| row[n]).sum::<f64>();
        }
    }
    if let Some(path) = dump {
        let blocks = gamma.read_all()?;
        let dense = iproduct!(0..nso, 0..nso, 0..nso, 0..nso).map(|(m, n, l, s)| blocks.value(m, n, l, s)).collect_vec();
        util::write_npy(path, &[nso; 4], &dense)?;
        info!("SO-basis TPDM written to {}", path.display());
    }
    ctx.store().close(units::SO_TPDM, true)?;
    Ok(TpdmResults { norm_sq, trace })
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::MemoryBudget;
    use crate::irrep::Dimension;
    use crate::mospace::{MOSpace, SpaceRegistry};
    use crate::store::BlockStore;
    use crate::util::unique_scratch_dir;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const MOPI: [usize; 2] = [2, 1];
    const SOPI: [usize; 2] = [3, 2];

    fn context(tag: &str, memory: usize) -> (DpdContext, DpdConfig) {
        let dims = [(SpaceId::AlphaMo, MOPI), (SpaceId::BetaMo, MOPI), (SpaceId::So, SOPI)];
        let spaces = SpaceRegistry::from_spaces(
            2,
            dims.into_iter().map(|(id, c)| MOSpace::with_default_tags(id, Dimension::new(c.to_vec()).unwrap())),
        )
        .unwrap();
        let scratch = unique_scratch_dir(tag);
        let store = BlockStore::new(&scratch, "dpd").unwrap();
        let ctx = DpdContext::new(spaces, store, MemoryBudget::new(memory));
        ctx.store().open(units::TPDM_PRESORT, OpenMode::Create).unwrap();
        (ctx, DpdConfig { scratch_dir: scratch, ..Default::default() })
    }

    /// Dense symmetric-pair TPDMs and block-diagonal coefficients.
    struct Inputs {
        gamma: [Vec<f64>; 3],
        ca: Vec<f64>,
        cb: Vec<f64>,
    }

    fn mo_sym(p: usize) -> usize {
        if p < MOPI[0] { 0 } else { 1 }
    }

    fn so_sym(m: usize) -> usize {
        if m < SOPI[0] { 0 } else { 1 }
    }

    fn inputs() -> Inputs {
        let mut rng = StdRng::seed_from_u64(7);
        let mut gamma = || {
            let packed: Vec<f64> = (0..81).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let mut dense = vec![0.0; 81];
            for (p, q, r, s) in iproduct!(0..3, 0..3, 0..3, 0..3) {
                if mo_sym(p) ^ mo_sym(q) != mo_sym(r) ^ mo_sym(s) {
                    continue;
                }
                let (pq, rs) = ((p.max(q), p.min(q)), (r.max(s), r.min(s)));
                dense[((p * 3 + q) * 3 + r) * 3 + s] = packed[((pq.0 * 3 + pq.1) * 3 + rs.0) * 3 + rs.1];
            }
            dense
        };
        let gamma = [gamma(), gamma(), gamma()];
        let mut coefficients = || {
            let mut c = vec![0.0; 15];
            for (m, p) in iproduct!(0..5, 0..3) {
                if so_sym(m) == mo_sym(p) {
                    c[m * 3 + p] = rng.gen_range(-1.0..1.0);
                }
            }
            c
        };
        let (ca, cb) = (coefficients(), coefficients());
        Inputs { gamma, ca, cb }
    }

    fn reference(x: &Inputs, a: usize, b: usize, c: usize, d: usize) -> f64 {
        let g = |t: usize, p: usize, q: usize, r: usize, s: usize| x.gamma[t][((p * 3 + q) * 3 + r) * 3 + s];
        let (ca, cb) = (|m: usize, p: usize| x.ca[m * 3 + p], |m: usize, p: usize| x.cb[m * 3 + p]);
        iproduct!(0..3, 0..3, 0..3, 0..3)
            .map(|(p, q, r, s)| {
                ca(c, p) * ca(d, q) * (g(0, p, q, r, s) * ca(a, r) * ca(b, s) + g(1, p, q, r, s) * cb(a, r) * cb(b, s))
                    + cb(c, p) * cb(d, q) * cb(a, r) * cb(b, s) * g(2, p, q, r, s)
            })
            .sum()
    }

    fn run(tag: &str, memory: usize, x: &Inputs) -> Vec<f64> {
        let (ctx, config) = context(tag, memory);
        let g = |t: usize| move |p: usize, q: usize, r: usize, s: usize| x.gamma[t][((p * 3 + q) * 3 + r) * 3 + s];
        write_mo_tpdm(&ctx, g(0), g(1), g(2)).unwrap();
        write_mo_coefficients(&ctx, |m, p| x.ca[m * 3 + p], |m, p| x.cb[m * 3 + p]).unwrap();
        backtransform_tpdm_unrestricted(&ctx, &config).unwrap();
        assert!(!ctx.store().path(units::TPDM_PRESORT).exists());
        assert!(!ctx.store().path(units::TPDM_HALFTRANS).exists());

        let dump = ctx.store().dir().join("so_tpdm.npy");
        let summary = so_tpdm_summary(&ctx, Some(&dump)).unwrap();
        let dense = util::tensor_from_npy(&dump).unwrap();
        let values = iproduct!(0..5, 0..5, 0..5, 0..5).map(|(a, b, c, d)| dense[[a, b, c, d]]).collect_vec();
        let trace: f64 = iproduct!(0..5, 0..5).map(|(m, n)| dense[[m, m, n, n]]).sum();
        assert_abs_diff_eq!(summary.trace, trace, epsilon = 1e-10);
        std::fs::remove_dir_all(ctx.store().dir()).unwrap();
        values
    }

    #[test]
    fn test_backtransform_matches_reference() {
        let x = inputs();
        let values = run("tpdm-ref", 1 << 20, &x);
        for (idx, (a, b, c, d)) in iproduct!(0..5, 0..5, 0..5, 0..5).enumerate() {
            let expected = if so_sym(a) ^ so_sym(b) == so_sym(c) ^ so_sym(d) { reference(&x, a, b, c, d) } else { 0.0 };
            assert_abs_diff_eq!(values[idx], expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_backtransform_is_tiling_invariant() {
        let x = inputs();
        let full = run("tpdm-full", 1 << 20, &x);
        let tiled = run("tpdm-tiled", 40, &x);
        for (a, b) in full.iter().zip(&tiled) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }
}
