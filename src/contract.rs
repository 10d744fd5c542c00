//! Symmetry-blocked contraction kernels.
//!
//! Every kernel reduces to one dense multiply per compatible irrep pair.
//! Blocks with a zero extent are skipped. A leg-size mismatch is a
//! programming error and panics.

use crate::cache::{BlockMatrix, MatMut, MatRef};
use crate::descriptor::{Packing, PairSpec};
use crate::engine::{Buf4, File2};
use crate::irrep::{Irrep, compose};
use crate::mospace::SpaceId;
use crate::prelude::*;

/// `C = alpha * op(A) * op(B) + beta * C` on row-major matrices.
#[allow(clippy::too_many_arguments)]
pub fn gemm(device: &DeviceTsr, ta: bool, tb: bool, alpha: f64, a: MatRef, b: MatRef, beta: f64, c: MatMut) {
    let (m, ka) = if ta { (a.cols, a.rows) } else { (a.rows, a.cols) };
    let (kb, n) = if tb { (b.cols, b.rows) } else { (b.rows, b.cols) };
    if ka != kb || c.rows != m || c.cols != n {
        panic!("[fatal] contraction shape mismatch: op(A) is {m}x{ka}, op(B) is {kb}x{n}, C is {}x{}", c.rows, c.cols);
    }
    if m == 0 || n == 0 {
        return;
    }
    if ka == 0 {
        if beta == 0.0 {
            c.data.fill(0.0);
        } else if beta != 1.0 {
            c.data.iter_mut().for_each(|x| *x *= beta);
        }
        return;
    }

    let a_tsr = rt::asarray((a.data, [a.rows, a.cols].c(), device));
    let b_tsr = rt::asarray((b.data, [b.rows, b.cols].c(), device));
    let mut c_tsr = rt::asarray((c.data, [c.rows, c.cols].c(), device));
    match (ta, tb) {
        (false, false) => c_tsr.matmul_from(&a_tsr, &b_tsr, alpha, beta),
        (true, false) => c_tsr.matmul_from(&a_tsr.t(), &b_tsr, alpha, beta),
        (false, true) => c_tsr.matmul_from(&a_tsr, &b_tsr.t(), alpha, beta),
        (true, true) => c_tsr.matmul_from(&a_tsr.t(), &b_tsr.t(), alpha, beta),
    };
}

/// Rows of `z` prepared for accumulation: scaled by `beta`, or zero.
fn init_rows(z: &Buf4, h: Irrep, start: usize, count: usize, beta: f64) -> Result<BlockMatrix> {
    if beta == 0.0 {
        return Ok(z.alloc_rows(h, count));
    }
    let mut block = z.read_rows(h, start, count)?;
    block.scale(beta);
    Ok(block)
}

fn leg_space(spec_row: PairSpec, spec_col: PairSpec, leg: usize) -> SpaceId {
    match leg {
        0 => spec_row.p,
        1 => spec_row.q,
        2 => spec_col.p,
        3 => spec_col.q,
        _ => panic!("[fatal] a 4-index tensor has no leg {leg}"),
    }
}

/* #region contract424 */

/// `Z = alpha * X ×_leg Y + beta * Z`.
///
/// Leg `leg` of the 4-index `X` is summed against index `sum_y` of the
/// 2-index `Y`; the other index of `Y` takes its place in `Z`, and the
/// remaining legs keep their positions.
pub fn contract424(x: &Buf4, y: &File2, z: &Buf4, leg: usize, sum_y: usize, alpha: f64, beta: f64) -> Result<()> {
    check_contract424(x, y, z, leg, sum_y);
    let yb = y.read()?;
    let device = x.ctx().device();
    let nirrep = x.nirrep();
    let ysym = y.sym();

    if leg >= 2 {
        let (xcol, zcol) = (x.col_index(), z.col_index());
        for h in 0..nirrep {
            let (hxc, hzc) = (compose(h, x.sym()), compose(h, z.sym()));
            let (rows, xcols, zcols) = (x.rowtot(h), x.coltot(h), z.coltot(h));
            if rows == 0 || zcols == 0 {
                continue;
            }
            let plan = x.ctx().memory().bucket_plan(rows, xcols, zcols);
            debug!("contract424 '{}' leg {leg} irrep {h}: {plan:?}", x.label());
            for (start, count) in plan.buckets() {
                let mut zb = init_rows(z, h, start, count, beta)?;
                if xcols > 0 {
                    let xb = x.read_rows(h, start, count)?;
                    for m in 0..count {
                        let (xrow, zrow) = (xb.row(m), zb.row_mut(m));
                        for gr in 0..nirrep {
                            let gs = compose(hxc, gr);
                            let nr = xcol.p_dim().count(gr);
                            let ns = xcol.q_dim().count(gs);
                            let xseg = MatRef::new(&xrow[xcol.sub_block_offset(hxc, gr)..], nr, ns);
                            if leg == 3 {
                                // Z[.., r s'] += X[.., r s] Y(s, s')
                                let gsz = compose(gs, ysym);
                                let nsz = zcol.q_dim().count(gsz);
                                let zseg = MatMut::new(&mut zrow[zcol.sub_block_offset(hzc, gr)..], nr, nsz);
                                let (yblk, ty) = if sum_y == 0 { (yb.block(gs), false) } else { (yb.block(gsz), true) };
                                gemm(device, false, ty, alpha, xseg, yblk.mat(), 1.0, zseg);
                            } else {
                                // Z[.., r' s] += Y(r, r') X[.., r s]
                                let grz = compose(gr, ysym);
                                let nrz = zcol.p_dim().count(grz);
                                let zseg = MatMut::new(&mut zrow[zcol.sub_block_offset(hzc, grz)..], nrz, ns);
                                let (yblk, ty) = if sum_y == 0 { (yb.block(gr), true) } else { (yb.block(grz), false) };
                                gemm(device, ty, false, alpha, yblk.mat(), xseg, 1.0, zseg);
                            }
                        }
                    }
                }
                z.write_rows(h, start, &zb)?;
            }
        }
    } else {
        // one (Gp, h ^ Gp) row sub-block of X and its image in Z at a time
        let (xrow, zrow) = (x.row_index(), z.row_index());
        for h in 0..nirrep {
            let hz = compose(h, ysym);
            let cols = x.coltot(h);
            if z.rowtot(hz) == 0 || cols == 0 {
                continue;
            }
            for gp in 0..nirrep {
                let gq = compose(h, gp);
                let (np, nq) = (xrow.p_dim().count(gp), xrow.q_dim().count(gq));
                let xoff = xrow.sub_block_offset(h, gp);
                // Z[p' q, ..] += Y(p, p') X[p q, ..] or Z[p q', ..] += Y(q, q') X[p q, ..]
                let (gpz, gqz) = if leg == 0 { (compose(gp, ysym), gq) } else { (gp, compose(gq, ysym)) };
                let (npz, nqz) = (zrow.p_dim().count(gpz), zrow.q_dim().count(gqz));
                let zoff = zrow.sub_block_offset(hz, gpz);
                if npz * nqz == 0 {
                    continue;
                }
                let mut zb = init_rows(z, hz, zoff, npz * nqz, beta)?;
                if np * nq > 0 {
                    let xb = x.read_rows(h, xoff, np * nq)?;
                    if leg == 0 {
                        let (yblk, ty) = if sum_y == 0 { (yb.block(gp), true) } else { (yb.block(gpz), false) };
                        let xsub = MatRef::new(xb.as_slice(), np, nq * cols);
                        gemm(device, ty, false, alpha, yblk.mat(), xsub, 1.0, MatMut::new(zb.as_mut_slice(), npz, nq * cols));
                    } else {
                        let (yblk, ty) = if sum_y == 0 { (yb.block(gq), true) } else { (yb.block(gqz), false) };
                        for p in 0..np {
                            let xsub = MatRef::new(&xb.as_slice()[p * nq * cols..], nq, cols);
                            let zsub = MatMut::new(&mut zb.as_mut_slice()[p * nqz * cols..], nqz, cols);
                            gemm(device, ty, false, alpha, yblk.mat(), xsub, 1.0, zsub);
                        }
                    }
                }
                z.write_rows(hz, zoff, &zb)?;
            }
        }
    }
    Ok(())
}

fn check_contract424(x: &Buf4, y: &File2, z: &Buf4, leg: usize, sum_y: usize) {
    assert!(leg < 4 && sum_y < 2, "[fatal] contract424 called with leg {leg} and index {sum_y}");
    let spaces = x.ctx().spaces();
    let (xr, xc) = (x.row_index().spec(), x.col_index().spec());
    let (zr, zc) = (z.row_index().spec(), z.col_index().spec());
    let (y_sum, y_free) = if sum_y == 0 { (y.row_space(), y.col_space()) } else { (y.col_space(), y.row_space()) };

    let x_leg = leg_space(xr, xc, leg);
    let z_leg = leg_space(zr, zc, leg);
    assert!(
        spaces.compatible(x_leg, y_sum) && spaces.compatible(z_leg, y_free),
        "[fatal] contract424: leg {leg} of '{}' ({}) does not match '{}' ({}{}) and '{}' ({})",
        x.label(),
        x_leg.label(),
        y.label(),
        y.row_space().label(),
        y.col_space().label(),
        z.label(),
        z_leg.label()
    );
    assert_eq!(z.sym(), compose(x.sym(), y.sym()), "[fatal] contract424: irrep of '{}' is inconsistent", z.label());

    let (x_touched, x_kept, z_touched, z_kept) = if leg < 2 { (xr, xc, zr, zc) } else { (xc, xr, zc, zr) };
    assert_eq!(x_kept, z_kept, "[fatal] contract424: untouched composite of '{}' and '{}' differ", x.label(), z.label());
    assert!(
        x_touched.packing == Packing::Unpacked && z_touched.packing == Packing::Unpacked,
        "[fatal] contract424: leg {leg} belongs to a packed composite index"
    );
    let other = |spec: PairSpec| if leg % 2 == 0 { spec.q } else { spec.p };
    assert_eq!(other(x_touched), other(z_touched), "[fatal] contract424: partner leg of '{}' changed", z.label());
}

/* #endregion */

/* #region contract444 */

/// `Z = alpha * X·Y + beta * Z` summing over one composite index of each.
///
/// `target_x` (`target_y`) selects the composite of `X` (`Y`) that becomes the
/// rows (columns) of `Z`; the other composites are summed. Row buckets are
/// used when `target_x == 0`.
pub fn contract444(x: &Buf4, y: &Buf4, z: &Buf4, target_x: usize, target_y: usize, alpha: f64, beta: f64) -> Result<()> {
    assert!(target_x < 2 && target_y < 2, "[fatal] contract444 targets must be 0 or 1");
    let composites = |b: &Buf4| (b.row_index().spec(), b.col_index().spec());
    let (xr, xc) = composites(x);
    let (yr, yc) = composites(y);
    let (x_target, x_sum) = if target_x == 0 { (xr, xc) } else { (xc, xr) };
    let (y_target, y_sum) = if target_y == 0 { (yr, yc) } else { (yc, yr) };
    assert_eq!(x_sum, y_sum, "[fatal] contract444: summed composites of '{}' and '{}' differ", x.label(), y.label());
    assert!(
        z.row_index().spec() == x_target && z.col_index().spec() == y_target,
        "[fatal] contract444: layout of '{}' does not match its factors",
        z.label()
    );
    assert_eq!(z.sym(), compose(x.sym(), y.sym()), "[fatal] contract444: irrep of '{}' is inconsistent", z.label());

    let device = x.ctx().device();
    for hz in 0..z.nirrep() {
        let hzc = compose(hz, z.sym());
        let g = compose(hz, x.sym());
        let (zrows, zcols) = (z.rowtot(hz), z.coltot(hz));
        if zrows == 0 || zcols == 0 {
            continue;
        }
        let yb = y.read_irrep(if target_y == 0 { hzc } else { g })?;
        let tb = target_y == 0;
        if target_x == 0 {
            let plan = x.ctx().memory().bucket_plan(zrows, x.coltot(hz), zcols);
            debug!("contract444 '{}' irrep {hz}: {plan:?}", z.label());
            for (start, count) in plan.buckets() {
                let xb = x.read_rows(hz, start, count)?;
                let mut zb = init_rows(z, hz, start, count, beta)?;
                gemm(device, false, tb, alpha, xb.mat(), yb.mat(), 1.0, zb.mat_mut());
                z.write_rows(hz, start, &zb)?;
            }
        } else {
            let xb = x.read_irrep(g)?;
            let mut zb = init_rows(z, hz, 0, zrows, beta)?;
            gemm(device, true, tb, alpha, xb.mat(), yb.mat(), 1.0, zb.mat_mut());
            z.write_irrep(hz, &zb)?;
        }
    }
    Ok(())
}

/* #endregion */

/* #region contract222 */

/// 2-index analog of [`contract444`].
pub fn contract222(x: &File2, y: &File2, z: &File2, target_x: usize, target_y: usize, alpha: f64, beta: f64) -> Result<()> {
    assert!(target_x < 2 && target_y < 2, "[fatal] contract222 targets must be 0 or 1");
    let spaces = x.ctx().spaces();
    let (x_target, x_sum) =
        if target_x == 0 { (x.row_space(), x.col_space()) } else { (x.col_space(), x.row_space()) };
    let (y_target, y_sum) =
        if target_y == 0 { (y.row_space(), y.col_space()) } else { (y.col_space(), y.row_space()) };
    assert!(
        spaces.compatible(x_sum, y_sum)
            && spaces.compatible(z.row_space(), x_target)
            && spaces.compatible(z.col_space(), y_target),
        "[fatal] contract222: index spaces of '{}', '{}' and '{}' do not match",
        x.label(),
        y.label(),
        z.label()
    );
    assert_eq!(z.sym(), compose(x.sym(), y.sym()), "[fatal] contract222: irrep of '{}' is inconsistent", z.label());

    let device = x.ctx().device();
    let xb = x.read()?;
    let yb = y.read()?;
    let mut zb = if beta == 0.0 { z.alloc() } else { z.read()? };
    for hz in 0..z.nirrep() {
        let hzc = compose(hz, z.sym());
        let g = compose(hz, x.sym());
        let xblk = xb.block(if target_x == 0 { hz } else { g });
        let yblk = yb.block(if target_y == 0 { hzc } else { g });
        gemm(device, target_x == 1, target_y == 0, alpha, xblk.mat(), yblk.mat(), beta, zb.block_mut(hz).mat_mut());
    }
    z.write(&zb)
}

/* #endregion */
