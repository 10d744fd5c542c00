//! Three-particle (triples) energy correction in the semicanonical basis.

use crate::cache::{BlockMatrix, MatRef};
use crate::contract::gemm;
use crate::descriptor::{PairIndex, PairSpec};
use crate::engine::DpdContext;
use crate::irrep::{Dimension, Irrep, compose};
use crate::mospace::Spin;
use crate::prelude::*;
use crate::semicanonical::{SemicanonicalOrbitals, semicanonical_rotation, semicanonicalize_tensors};
use crate::sort::{Perm3, TripleBlock, sort_3d};
use crate::store::units;
use std::sync::Arc;

/* #region inputs */

/// Store the same-spin inputs of `spin` from functions of absolute subspace
/// indices: plain `<IA|BC>` and `<AI|JK>` integrals and the antisymmetric
/// cumulant `L_IJAB`.
pub fn write_spin_tensors(
    ctx: &DpdContext,
    spin: Spin,
    ovvv: impl Fn(usize, usize, usize, usize) -> f64,
    vooo: impl Fn(usize, usize, usize, usize) -> f64,
    lambda: impl Fn(usize, usize, usize, usize) -> f64,
) -> Result<()> {
    let (o, v) = (spin.occ().label(), spin.vir().label());
    let (ov, vv, vo, oo) = (format!("[{o},{v}]"), format!("[{v},{v}]"), format!("[{v},{o}]"), format!("[{o},{o}]"));
    ctx.buf4_plain(units::MO_INTS, 0, &ov, &vv, &format!("MO Ints <{o}{v}|{v}{v}>"))?.write_from_fn(ovvv)?;
    ctx.buf4_plain(units::MO_INTS, 0, &vo, &oo, &format!("MO Ints <{v}{o}|{o}{o}>"))?.write_from_fn(vooo)?;
    let (oo_packed, vv_packed) = (format!("[{o}>{o}]-"), format!("[{v}>{v}]-"));
    ctx.buf4_plain(units::AMPLITUDES, 0, &oo_packed, &vv_packed, &format!("Lambda <{o}{o}|{v}{v}>"))?.write_from_fn(lambda)?;
    Ok(())
}

/// Load the `.npy` inputs of `spin` into the engine and return its Fock matrix.
pub fn load_spin_inputs(ctx: &DpdContext, spin: Spin, inputs: &SpinInputs) -> Result<Tsr> {
    let no = ctx.spaces().dim(spin.occ())?.sum();
    let nv = ctx.spaces().dim(spin.vir())?.sum();
    let fock = util::tensor_from_npy(&inputs.fock)?;
    let ovvv = util::tensor_from_npy(&inputs.ovvv)?;
    let vooo = util::tensor_from_npy(&inputs.vooo)?;
    let lambda = util::tensor_from_npy(&inputs.lambda)?;
    util::check_shape(&ovvv, &[no, nv, nv, nv], &format!("{} <OV|VV>", spin.name()))?;
    util::check_shape(&vooo, &[nv, no, no, no], &format!("{} <VO|OO>", spin.name()))?;
    util::check_shape(&lambda, &[no, no, nv, nv], &format!("{} cumulant", spin.name()))?;
    write_spin_tensors(
        ctx,
        spin,
        |p, q, r, s| ovvv[[p, q, r, s]],
        |p, q, r, s| vooo[[p, q, r, s]],
        |p, q, r, s| lambda[[p, q, r, s]],
    )?;
    Ok(fock)
}

/* #endregion */

/* #region same-spin triples */

/// Everything one occupied triple needs, shared read-only across workers.
struct SameSpinTriples<'a> {
    ctx: &'a DpdContext,
    i_ovvv: Buf4<'a>,
    lambda: Vec<BlockMatrix>,
    i_ooov: Vec<BlockMatrix>,
    oo: Arc<PairIndex>,
    ov: Arc<PairIndex>,
    vv: Arc<PairIndex>,
    occ: Dimension,
    vir: Dimension,
    occ_sym: Vec<Irrep>,
    orbitals: &'a SemicanonicalOrbitals,
}

impl<'a> SameSpinTriples<'a> {
    fn new(ctx: &'a DpdContext, orbitals: &'a SemicanonicalOrbitals) -> Result<Self> {
        let spin = orbitals.spin;
        let (o, v) = (spin.occ().label(), spin.vir().label());
        let (oo, ov, vv) = (format!("[{o},{o}]"), format!("[{o},{v}]"), format!("[{v},{v}]"));
        let lambda = ctx.buf4_plain(units::AMPLITUDES, 0, &oo, &vv, &format!("Lambda <{o}'{o}'|{v}'{v}'>"))?;
        let i_ovvv = ctx.buf4_plain(units::MO_INTS, 0, &ov, &vv, &format!("MO Ints <{o}'{v}'||{v}'{v}'>"))?;
        let i_ooov = ctx.buf4_plain(units::MO_INTS, 0, &oo, &ov, &format!("MO Ints <{o}'{o}'||{o}'{v}'>"))?;

        let lambda_blocks = (0..ctx.nirrep()).map(|h| lambda.read_irrep(h)).collect::<Result<Vec<_>>>()?;
        let ooov_blocks = (0..ctx.nirrep()).map(|h| i_ooov.read_irrep(h)).collect::<Result<Vec<_>>>()?;
        let occ = ctx.spaces().dim(spin.occ())?.clone();
        Ok(Self {
            ctx,
            lambda: lambda_blocks,
            i_ooov: ooov_blocks,
            oo: ctx.pair_index(PairSpec::unpacked(spin.occ(), spin.occ()))?,
            ov: ctx.pair_index(PairSpec::unpacked(spin.occ(), spin.vir()))?,
            vv: ctx.pair_index(PairSpec::unpacked(spin.vir(), spin.vir()))?,
            occ_sym: occ.orbsym(),
            occ,
            vir: ctx.spaces().dim(spin.vir())?.clone(),
            i_ovvv,
            orbitals,
        })
    }

    /// `x[pq][r] += alpha * X(pq;r)` for the triple `(i, j, k)`, where
    ///
    /// ```text
    /// X(pq;r) = - Σd L_jkrd <id||pq> + Σd L_ikrd <jd||pq> + Σd L_jird <kd||pq>
    ///           - Σl L_ilpq <jk||lr> + Σl L_jlpq <ik||lr> + Σl L_klpq <ji||lr>
    /// ```
    fn add_x(&self, [i, j, k]: [usize; 3], alpha: f64, x: &mut TripleBlock) -> Result<()> {
        let device = self.ctx.device();
        let nirrep = self.ctx.nirrep();
        for (o, [m, n], sign) in [(i, [j, k], -1.0), (j, [i, k], 1.0), (k, [j, i], 1.0)] {
            let Some(mn) = self.oo.lookup(m, n) else {
                continue;
            };
            let (go, gmn) = (self.occ_sym[o], mn.irrep);

            for gd in 0..nirrep {
                let (gpq, gr) = (compose(go, gd), compose(gmn, gd));
                let (nd, nr, npq) = (self.vir.count(gd), self.vir.count(gr), self.vv.tot(gpq));
                if nd == 0 || nr == 0 || npq == 0 {
                    continue;
                }
                // rows (o, d) of <OV||VV> for every d of irrep gd
                let od = self.ov.first_pair_offset(gpq, o);
                let ints = self.i_ovvv.read_rows(gpq, od, nd)?;
                let lrow = self.lambda[gmn].row(mn.index);
                let lseg = MatRef::new(&lrow[self.vv.sub_block_offset(gmn, gr)..], nr, nd);
                gemm(device, true, true, alpha * sign, ints.mat(), lseg, 1.0, x.block_mut(gpq).mat_mut());
            }

            for gl in 0..nirrep {
                let (gpq, gr) = (compose(go, gl), compose(gmn, gl));
                let (nl, nr, npq) = (self.occ.count(gl), self.vir.count(gr), self.vv.tot(gpq));
                if nl == 0 || nr == 0 || npq == 0 {
                    continue;
                }
                let ol = self.oo.first_pair_offset(gpq, o);
                let lseg = MatRef::new(&self.lambda[gpq].as_slice()[ol * npq..], nl, npq);
                let irow = self.i_ooov[gmn].row(mn.index);
                let iseg = MatRef::new(&irow[self.ov.sub_block_offset(gmn, gl)..], nl, nr);
                gemm(device, true, false, alpha * sign, lseg, iseg, 1.0, x.block_mut(gpq).mat_mut());
            }
        }
        Ok(())
    }

    /// Energy contribution of the ordered triple `i > j > k`.
    fn triple_energy(&self, ijk: [usize; 3]) -> Result<f64> {
        let [i, j, k] = ijk;
        let gijk = compose(compose(self.occ_sym[i], self.occ_sym[j]), self.occ_sym[k]);
        let memory = self.ctx.memory();

        // W_abc = X(ab;c) + X(bc;a) - X(ac;b)
        let mut x = TripleBlock::new(memory, self.vv.clone(), gijk);
        self.add_x(ijk, 1.0, &mut x)?;
        let mut w = TripleBlock::new(memory, self.vv.clone(), gijk);
        sort_3d(&x, &mut w, Perm3::Abc, false);
        sort_3d(&x, &mut w, Perm3::Cab, true);
        x.scale(-1.0);
        sort_3d(&x, &mut w, Perm3::Acb, true);
        drop(x);

        let (e_occ, e_vir) = (&self.orbitals.occ_energies, &self.orbitals.vir_energies);
        let dijk = e_occ[i] + e_occ[j] + e_occ[k];
        let mut l = TripleBlock::new(memory, self.vv.clone(), gijk);
        sort_3d(&w, &mut l, Perm3::Abc, false);
        l.map_inplace(|a, b, c, value| value / (dijk - e_vir[a] - e_vir[b] - e_vir[c]));
        Ok(l.dot(&w) / 6.0)
    }
}

/// Same-spin triples energy from the semicanonical tensors of `orbitals.spin`.
pub fn compute_triples_same_spin(ctx: &DpdContext, orbitals: &SemicanonicalOrbitals) -> Result<f64> {
    let timer = std::time::Instant::now();
    let engine = SameSpinTriples::new(ctx, orbitals)?;
    let nocc = engine.occ.sum();
    let triples = (0..nocc).flat_map(|i| (0..i).flat_map(move |j| (0..j).map(move |k| [i, j, k]))).collect_vec();
    debug!("{} triples: {} occupied triples", orbitals.spin.name(), triples.len());

    let contributions = triples.par_iter().map(|&ijk| engine.triple_energy(ijk)).collect::<Result<Vec<f64>>>()?;
    let energy = contributions.iter().sum();
    info!("Time elapsed ({} triples): {:?}", orbitals.spin.name(), timer.elapsed());
    Ok(energy)
}

/// Mixed-spin contribution with two alpha and one beta index.
pub fn compute_triples_aab(_ctx: &DpdContext) -> f64 {
    warn!("three-particle energy (AAB) is not implemented; contributing 0");
    0.0
}

/// Mixed-spin contribution with one alpha and two beta indices.
pub fn compute_triples_abb(_ctx: &DpdContext) -> f64 {
    warn!("three-particle energy (ABB) is not implemented; contributing 0");
    0.0
}

/* #endregion */

/// Semicanonicalize both spins and evaluate the three-particle energy.
pub fn compute_three_particle_energy(ctx: &DpdContext, fock_alpha: &Tsr, fock_beta: &Tsr) -> Result<TriplesResults> {
    info!("Evaluating three-particle energy correction...");
    let alpha = semicanonical_rotation(ctx, units::AMPLITUDES, Spin::Alpha, fock_alpha)?;
    let beta = semicanonical_rotation(ctx, units::AMPLITUDES, Spin::Beta, fock_beta)?;
    semicanonicalize_tensors(ctx, Spin::Alpha)?;
    semicanonicalize_tensors(ctx, Spin::Beta)?;

    let e_aaa = compute_triples_same_spin(ctx, &alpha)?;
    let e_aab = compute_triples_aab(ctx);
    let e_abb = compute_triples_abb(ctx);
    let e_bbb = compute_triples_same_spin(ctx, &beta)?;
    let e_total = e_aaa + e_aab + e_abb + e_bbb;

    info!("*DCFT Three-particle Energy (AAA)                = {e_aaa:20.15}");
    info!("*DCFT Three-particle Energy (AAB)                = {e_aab:20.15}");
    info!("*DCFT Three-particle Energy (ABB)                = {e_abb:20.15}");
    info!("*DCFT Three-particle Energy (BBB)                = {e_bbb:20.15}");
    Ok(TriplesResults { e_aaa, e_aab, e_abb, e_bbb, e_total })
}
