//! Rotation of integrals and cumulants to the semicanonical basis.
//!
//! The Fock-like matrix is diagonalized separately in its occupied and
//! virtual blocks; occupied-virtual couplings are dropped. The eigenvector
//! matrices are stored as `U <O|O>` and `U <V|V>` (lowercase for beta) and
//! applied leg by leg with [`contract424`].

use crate::contract::contract424;
use crate::engine::DpdContext;
use crate::irrep::Dimension;
use crate::mospace::Spin;
use crate::prelude::*;
use crate::sort::buf4_sort;
use crate::store::{FileUnit, units};

/// Semicanonical orbital energies of one spin, indexed by absolute
/// occupied (virtual) subspace orbitals.
#[derive(Debug, Clone, PartialEq)]
pub struct SemicanonicalOrbitals {
    pub spin: Spin,
    pub occ_energies: Vec<f64>,
    pub vir_energies: Vec<f64>,
}

/// Eigenvalues and row-major eigenvectors (columns) of a symmetric block.
fn eigh_block(device: &DeviceTsr, fock: &Tsr, idx: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let n = idx.len();
    if n == 0 {
        return (vec![], vec![]);
    }
    let block = iproduct!(idx, idx).map(|(&p, &q)| 0.5 * (fock[[p, q]] + fock[[q, p]])).collect_vec();
    let f = rt::asarray((block, vec![n, n].c(), device));
    let (w, v): (Tsr, Tsr) = rt::linalg::eigh(f.view()).into();
    let evals = (0..n).map(|k| w[[k]]).collect_vec();
    let evecs = iproduct!(0..n, 0..n).map(|(i, k)| v[[i, k]]).collect_vec();
    (evals, evecs)
}

/// Diagonalize the occupied and virtual blocks of `fock` (full MO space of
/// `spin`, each irrep occupied-first) and store the rotations on `unit`.
pub fn semicanonical_rotation(ctx: &DpdContext, unit: FileUnit, spin: Spin, fock: &Tsr) -> Result<SemicanonicalOrbitals> {
    let (occ, vir, mo) = (ctx.spaces().dim(spin.occ())?, ctx.spaces().dim(spin.vir())?, ctx.spaces().dim(spin.mo())?);
    util::check_shape(fock, &[mo.sum(), mo.sum()], &format!("{} Fock matrix", spin.name()))?;
    for h in 0..ctx.nirrep() {
        if occ.count(h) + vir.count(h) != mo.count(h) {
            bail!("irrep {h}: {} occupied and {} virtual orbitals do not add up to {} MOs", occ.count(h), vir.count(h), mo.count(h));
        }
    }

    let (o, v) = (spin.occ().label(), spin.vir().label());
    let u_occ = ctx.file2(unit, 0, o, o, &format!("U <{o}|{o}>"))?;
    let u_vir = ctx.file2(unit, 0, v, v, &format!("U <{v}|{v}>"))?;
    let mut u_occ_blocks = u_occ.alloc();
    let mut u_vir_blocks = u_vir.alloc();
    let mut occ_energies = vec![0.0; occ.sum()];
    let mut vir_energies = vec![0.0; vir.sum()];

    let fill = |h: usize, dim: &Dimension, first: usize, energies: &mut [f64], block: &mut BlockMatrix| {
        let idx = (0..dim.count(h)).map(|i| mo.offset(h) + first + i).collect_vec();
        let (evals, evecs) = eigh_block(ctx.device(), fock, &idx);
        energies[dim.offset(h)..dim.offset(h) + dim.count(h)].copy_from_slice(&evals);
        block.as_mut_slice().copy_from_slice(&evecs);
    };
    for h in 0..ctx.nirrep() {
        fill(h, occ, 0, &mut occ_energies, u_occ_blocks.block_mut(h));
        fill(h, vir, occ.count(h), &mut vir_energies, u_vir_blocks.block_mut(h));
    }
    u_occ.write(&u_occ_blocks)?;
    u_vir.write(&u_vir_blocks)?;
    u_occ.print()?;
    u_vir.print()?;

    debug!("{} semicanonical occupied energies: {occ_energies:?}", spin.name());
    debug!("{} semicanonical virtual energies: {vir_energies:?}", spin.name());
    Ok(SemicanonicalOrbitals { spin, occ_energies, vir_energies })
}

/// Rotate one 4-index tensor leg by leg, storing each step under the
/// matching label. The first step reads `first`, which may use another layout.
fn rotate_legs(ctx: &DpdContext, first: &Buf4, legs: [(usize, &File2); 4], labels: &[String; 4], layout: (&str, &str)) -> Result<()> {
    for (n, (leg, u)) in legs.into_iter().enumerate() {
        let out = ctx.buf4_plain(first.file(), 0, layout.0, layout.1, &labels[n])?;
        if n == 0 {
            contract424(first, u, &out, leg, 0, 1.0, 0.0)?;
        } else {
            let prev = ctx.buf4_plain(first.file(), 0, layout.0, layout.1, &labels[n - 1])?;
            contract424(&prev, u, &out, leg, 0, 1.0, 0.0)?;
        }
    }
    Ok(())
}

/// Rotate `<OV||VV>`, `<VO||OO>` (then sorted to `<O'O'||O'V'>`) and the
/// cumulant `Lambda <OO|VV>` of `spin` to the semicanonical basis.
///
/// Expects `MO Ints <OV|VV>` and `MO Ints <VO|OO>` (plain, antisymmetrized
/// on read) on the integral unit and `Lambda <OO|VV>` (stored packed) plus
/// the rotations on the amplitude unit.
pub fn semicanonicalize_tensors(ctx: &DpdContext, spin: Spin) -> Result<()> {
    let timer = std::time::Instant::now();
    let (o, v) = (spin.occ().label(), spin.vir().label());
    let u_occ = ctx.file2(units::AMPLITUDES, 0, o, o, &format!("U <{o}|{o}>"))?;
    let u_vir = ctx.file2(units::AMPLITUDES, 0, v, v, &format!("U <{v}|{v}>"))?;

    // <IA||BC> -> <I'A'||B'C'>
    let (ov, vv) = (format!("[{o},{v}]"), format!("[{v},{v}]"));
    let ints = ctx.buf4(units::MO_INTS, 0, (&ov, &vv), (&ov, &vv), true, &format!("MO Ints <{o}{v}|{v}{v}>"))?;
    let labels = [
        format!("MO Ints <{o}{v}||{v}{v}'>"),
        format!("MO Ints <{o}{v}||{v}'{v}'>"),
        format!("MO Ints <{o}{v}'||{v}'{v}'>"),
        format!("MO Ints <{o}'{v}'||{v}'{v}'>"),
    ];
    rotate_legs(ctx, &ints, [(3, &u_vir), (2, &u_vir), (1, &u_vir), (0, &u_occ)], &labels, (&ov, &vv))?;

    // <AI||JK> -> <A'I'||J'K'> -> <K'J'||I'A'>
    let (vo, oo) = (format!("[{v},{o}]"), format!("[{o},{o}]"));
    let ints = ctx.buf4(units::MO_INTS, 0, (&vo, &oo), (&vo, &oo), true, &format!("MO Ints <{v}{o}|{o}{o}>"))?;
    let labels = [
        format!("MO Ints <{v}{o}||{o}{o}'>"),
        format!("MO Ints <{v}{o}||{o}'{o}'>"),
        format!("MO Ints <{v}{o}'||{o}'{o}'>"),
        format!("MO Ints <{v}'{o}'||{o}'{o}'>"),
    ];
    rotate_legs(ctx, &ints, [(3, &u_occ), (2, &u_occ), (1, &u_occ), (0, &u_vir)], &labels, (&vo, &oo))?;
    let rotated = ctx.buf4_plain(units::MO_INTS, 0, &vo, &oo, &labels[3])?;
    buf4_sort(&rotated, units::MO_INTS, "srqp", (&oo, &ov), &format!("MO Ints <{o}'{o}'||{o}'{v}'>"))?;

    // Lambda <IJ|AB> -> Lambda <I'J'|A'B'>
    let (oo_packed, vv_packed) = (format!("[{o}>{o}]-"), format!("[{v}>{v}]-"));
    let lambda =
        ctx.buf4(units::AMPLITUDES, 0, (&oo, &vv), (&oo_packed, &vv_packed), false, &format!("Lambda <{o}{o}|{v}{v}>"))?;
    let labels = [
        format!("Lambda <{o}{o}|{v}{v}'>"),
        format!("Lambda <{o}{o}|{v}'{v}'>"),
        format!("Lambda <{o}{o}'|{v}'{v}'>"),
        format!("Lambda <{o}'{o}'|{v}'{v}'>"),
    ];
    rotate_legs(ctx, &lambda, [(3, &u_vir), (2, &u_vir), (1, &u_occ), (0, &u_occ)], &labels, (&oo, &vv))?;
    ctx.buf4_plain(units::AMPLITUDES, 0, &oo, &vv, &labels[3])?.print()?;

    info!("{} tensors semicanonicalized in {:?}", spin.name(), timer.elapsed());
    Ok(())
}
