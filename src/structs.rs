use crate::moinfo::OrbitalLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/* #region engine configuration */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpdConfig {
    /// Memory budget for materialized blocks, in MiB.
    pub memory_mb: f64,
    pub scratch_dir: PathBuf,
    pub file_prefix: String,
    pub print: usize,
    pub keep_presort: bool,
    pub keep_halftrans: bool,
}

impl Default for DpdConfig {
    fn default() -> Self {
        Self {
            memory_mb: 256.0,
            scratch_dir: std::env::temp_dir().join(format!("dpd-{}", std::process::id())),
            file_prefix: "psi".to_string(),
            print: 1,
            keep_presort: false,
            keep_halftrans: false,
        }
    }
}

/* #endregion */

/* #region calculation input */

/// Input file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationInput {
    pub orbitals: OrbitalLayout,
    pub dpd: DpdConfig,
    pub triples: Option<TriplesInput>,
    pub tpdm: Option<TpdmInput>,
    pub ci: Option<CiInput>,
}

/// Same-spin inputs of the triples correction, as `.npy` files.
///
/// `fock` spans the full MO space with each irrep ordered occupied-first;
/// `ovvv` holds the plain `<IA|BC>`, `vooo` the plain `<AI|JK>` and `lambda` the
/// cumulant `L_IJAB`, all indexed by absolute subspace orbitals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpinInputs {
    pub fock: PathBuf,
    pub ovvv: PathBuf,
    pub vooo: PathBuf,
    pub lambda: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplesInput {
    pub alpha: SpinInputs,
    pub beta: SpinInputs,
}

/// MO-basis TPDM pieces (dense `[nmo; 4]`) and MO coefficients (`[nso, nmo]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpdmInput {
    pub tpdm_aa: PathBuf,
    pub tpdm_ab: PathBuf,
    pub tpdm_bb: PathBuf,
    pub c_alpha: PathBuf,
    pub c_beta: PathBuf,
    /// Dense `[nso; 4]` dump of the SO-basis result.
    pub output: Option<PathBuf>,
}

/// Dense one-electron (`[nmo, nmo]`) and two-electron (`[nmo; 4]`, chemist
/// notation) integrals for the CI integral set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiInput {
    pub onel: PathBuf,
    pub twoel: PathBuf,
    /// CI position of every MO (Pitzer order); frozen core first, frozen
    /// virtuals last. Defaults to grouping the active orbitals by irrep.
    pub order: Option<Vec<usize>>,
}

/* #endregion */

/* #region results */

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriplesResults {
    pub e_aaa: f64,
    pub e_aab: f64,
    pub e_abb: f64,
    pub e_bbb: f64,
    pub e_total: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TpdmResults {
    /// Sum of squares of the stored SO-basis TPDM elements.
    pub norm_sq: f64,
    /// `Σ_mn Γ(mm|nn)` over the packed SO basis.
    pub trace: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CiIntegralSummary {
    pub norb: usize,
    pub n_onel: usize,
    pub n_twoel: usize,
    pub max_k: Vec<f64>,
    pub max_k_overall: f64,
    pub tf_onel_trace: f64,
}

/* #endregion */
