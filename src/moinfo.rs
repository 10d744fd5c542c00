//! Orbital-space information: occupations per irrep, derived subspaces and
//! the wavefunction symmetry.

use crate::irrep::{Dimension, Irrep, IrrepLabels};
use crate::mospace::{MOSpace, SpaceId, SpaceRegistry};
use crate::prelude::*;
use serde::{Deserialize, Serialize};

/// Orbital counts per irrep as given in the input file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitalLayout {
    pub irrep_labels: Vec<String>,
    pub mopi: Vec<usize>,
    /// Symmetry orbitals per irrep; the MO counts when absent.
    pub sopi: Option<Vec<usize>>,
    pub docc: Option<Vec<usize>>,
    #[serde(alias = "socc", alias = "active")]
    pub actv: Option<Vec<usize>>,
    pub frozen_docc: Option<Vec<usize>>,
    pub frozen_uocc: Option<Vec<usize>>,
    pub wfn_sym: String,
}

/// Validated orbital spaces derived from an [`OrbitalLayout`].
#[derive(Debug, Clone)]
pub struct MOInfo {
    labels: IrrepLabels,
    wfn_sym: Irrep,
    mopi: Dimension,
    sopi: Dimension,
    docc: Dimension,
    actv: Dimension,
    frozen_docc: Dimension,
    frozen_uocc: Dimension,
    guess_occupation: bool,
}

impl OrbitalLayout {
    pub fn nirrep(&self) -> usize {
        self.mopi.len()
    }

    /// Validate counts and resolve the wavefunction symmetry.
    pub fn resolve(&self) -> Result<MOInfo> {
        let nirrep = self.nirrep();
        let labels = match self.irrep_labels.len() {
            0 => IrrepLabels::numbered(nirrep)?,
            n if n == nirrep => IrrepLabels::new(self.irrep_labels.clone())?,
            n => bail!("{n} irrep labels given for {nirrep} irreps"),
        };
        let per_irrep = |what: &str, counts: &Option<Vec<usize>>| -> Result<Dimension> {
            match counts {
                None => Dimension::zeros(nirrep),
                Some(c) if c.len() == nirrep => Dimension::new(c.clone()),
                Some(c) => bail!("{what} has {} entries for {nirrep} irreps", c.len()),
            }
        };

        let mopi = Dimension::new(self.mopi.clone())?;
        let sopi = match &self.sopi {
            None => mopi.clone(),
            some => per_irrep("sopi", some)?,
        };
        let docc = per_irrep("docc", &self.docc)?;
        let actv = per_irrep("actv", &self.actv)?;
        let frozen_docc = per_irrep("frozen_docc", &self.frozen_docc)?;
        let frozen_uocc = per_irrep("frozen_uocc", &self.frozen_uocc)?;

        for h in 0..nirrep {
            if mopi.count(h) > sopi.count(h) {
                bail!("irrep {h} has {} MOs but only {} SOs", mopi.count(h), sopi.count(h));
            }
            if docc.count(h) + actv.count(h) > mopi.count(h) {
                bail!("irrep {h} has more occupied orbitals than MOs");
            }
            if frozen_docc.count(h) > docc.count(h) && self.docc.is_some() {
                bail!("irrep {h} freezes more core orbitals than are doubly occupied");
            }
            if frozen_docc.count(h) + frozen_uocc.count(h) > mopi.count(h) {
                bail!("irrep {h} freezes more orbitals than it has");
            }
        }

        Ok(MOInfo {
            wfn_sym: labels.resolve(&self.wfn_sym),
            labels,
            mopi,
            sopi,
            docc,
            actv,
            frozen_docc,
            frozen_uocc,
            guess_occupation: self.docc.is_none() && self.actv.is_none(),
        })
    }
}

impl MOInfo {
    pub fn nirrep(&self) -> usize {
        self.mopi.nirrep()
    }

    pub fn labels(&self) -> &IrrepLabels {
        &self.labels
    }

    pub fn wfn_sym(&self) -> Irrep {
        self.wfn_sym
    }

    pub fn mopi(&self) -> &Dimension {
        &self.mopi
    }

    pub fn sopi(&self) -> &Dimension {
        &self.sopi
    }

    pub fn docc(&self) -> &Dimension {
        &self.docc
    }

    pub fn actv(&self) -> &Dimension {
        &self.actv
    }

    pub fn frozen_docc(&self) -> &Dimension {
        &self.frozen_docc
    }

    pub fn frozen_uocc(&self) -> &Dimension {
        &self.frozen_uocc
    }

    pub fn guess_occupation(&self) -> bool {
        self.guess_occupation
    }

    /// Alpha occupied orbitals: doubly occupied plus active.
    pub fn alpha_occ(&self) -> Result<Dimension> {
        self.docc.checked_add(&self.actv)
    }

    pub fn beta_occ(&self) -> Dimension {
        self.docc.clone()
    }

    pub fn alpha_vir(&self) -> Result<Dimension> {
        self.mopi.checked_sub(&self.alpha_occ()?)
    }

    pub fn beta_vir(&self) -> Result<Dimension> {
        self.mopi.checked_sub(&self.docc)
    }

    /// Orbitals left after dropping frozen core and frozen virtuals.
    pub fn ci_active(&self) -> Result<Dimension> {
        self.mopi.checked_sub(&self.frozen_docc)?.checked_sub(&self.frozen_uocc)
    }

    /// `(alpha, beta)` electron counts of the high-spin reference.
    pub fn electrons(&self) -> (usize, usize) {
        let (ndocc, nactv) = (self.docc.sum(), self.actv.sum());
        (ndocc + nactv, ndocc)
    }

    /// Registry holding every subspace derivable from the counts.
    pub fn spaces(&self) -> Result<SpaceRegistry> {
        let dims = [
            (SpaceId::AlphaOcc, self.alpha_occ()?),
            (SpaceId::BetaOcc, self.beta_occ()),
            (SpaceId::AlphaVir, self.alpha_vir()?),
            (SpaceId::BetaVir, self.beta_vir()?),
            (SpaceId::AlphaMo, self.mopi.clone()),
            (SpaceId::BetaMo, self.mopi.clone()),
            (SpaceId::So, self.sopi.clone()),
            (SpaceId::Active, self.ci_active()?),
        ];
        SpaceRegistry::from_spaces(self.nirrep(), dims.into_iter().map(|(id, dim)| MOSpace::with_default_tags(id, dim)))
    }

    /// Log the orbitals-per-irrep table.
    pub fn print_mo(&self) {
        let nirrep = self.nirrep();
        let pad = "     ".repeat(8 - nirrep);
        let header = self.labels.labels().iter().map(|l| format!("  {l:>3}")).join("");
        let row = |title: &str, dim: &Dimension| {
            let counts = dim.counts().iter().map(|n| format!("  {n:>3}")).join("");
            format!("  {title:<30}{pad}{counts}  {:>4}", dim.sum())
        };
        let rule = format!("  {}", "-".repeat(76));

        info!("  MOs per irrep:                {pad}{header} Total");
        info!("{rule}");
        info!("{}", row("Total", &self.sopi));
        if !self.guess_occupation {
            info!("{}", row("Doubly Occupied", &self.docc));
            info!("{}", row("Active/Singly Occupied", &self.actv));
        }
        info!("{rule}");
        if self.guess_occupation {
            info!("  Guessing orbital occupation");
        }
        info!("  Wavefunction symmetry: {} ({})", self.labels.label(self.wfn_sym), self.wfn_sym);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn water() -> OrbitalLayout {
        OrbitalLayout {
            irrep_labels: ["A1", "A2", "B1", "B2"].map(String::from).to_vec(),
            mopi: vec![4, 1, 2, 3],
            sopi: None,
            docc: Some(vec![3, 0, 1, 1]),
            actv: Some(vec![0, 0, 1, 0]),
            frozen_docc: Some(vec![1, 0, 0, 0]),
            frozen_uocc: Some(vec![0, 0, 0, 1]),
            wfn_sym: " b1 ".to_string(),
        }
    }

    #[test]
    fn test_derived_spaces() {
        let info = water().resolve().unwrap();
        assert_eq!(info.wfn_sym(), 2);
        assert_eq!(info.alpha_occ().unwrap().counts(), &[3, 0, 2, 1]);
        assert_eq!(info.beta_vir().unwrap().counts(), &[1, 1, 1, 2]);
        assert_eq!(info.ci_active().unwrap().counts(), &[3, 1, 2, 2]);
        assert_eq!(info.electrons(), (6, 5));

        let spaces = info.spaces().unwrap();
        assert_eq!(spaces.dim(SpaceId::So).unwrap().sum(), 10);
        assert!(spaces.compatible(SpaceId::AlphaOcc, SpaceId::AlphaOcc));
        assert!(!spaces.compatible(SpaceId::AlphaOcc, SpaceId::AlphaVir));
        info.print_mo();
    }

    #[test]
    fn test_wfn_sym_by_number_and_fallback() {
        let mut layout = water();
        layout.wfn_sym = "4".to_string();
        assert_eq!(layout.resolve().unwrap().wfn_sym(), 3);
        layout.wfn_sym = "E''".to_string();
        assert_eq!(layout.resolve().unwrap().wfn_sym(), 0);
    }

    #[test]
    fn test_inconsistent_counts() {
        let mut layout = water();
        layout.docc = Some(vec![5, 0, 1, 1]);
        assert!(layout.resolve().is_err());

        let mut layout = water();
        layout.actv = Some(vec![0, 0]);
        assert!(layout.resolve().is_err());

        let mut layout = water();
        layout.irrep_labels.pop();
        assert!(layout.resolve().is_err());
    }

    #[test]
    fn test_guess_occupation_from_yaml() {
        let layout: OrbitalLayout = serde_yaml::from_str("mopi: [2, 2]\nwfn_sym: '1'\n").unwrap();
        let info = layout.resolve().unwrap();
        assert!(info.guess_occupation());
        assert_eq!(info.labels().label(1), "2");
        assert_eq!(info.alpha_vir().unwrap().counts(), &[2, 2]);
    }
}
