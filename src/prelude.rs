#![allow(unused)]

/* #region for API callers */

pub use crate::cache::{BlockMatrix, BucketPlan, MemoryBudget};
pub use crate::ci_ints::PackedIntegrals;
pub use crate::descriptor::{Packing, PairIndex, PairSlot, PairSpec};
pub use crate::engine::{Buf4, Buf4Blocks, DpdContext, File2, File2Blocks};
pub use crate::irrep::{Dimension, Irrep, IrrepLabels, compose};
pub use crate::moinfo::{MOInfo, OrbitalLayout};
pub use crate::mospace::{MOSpace, SpaceId, SpaceRegistry, Spin};
pub use crate::semicanonical::SemicanonicalOrbitals;
pub use crate::sort::{Perm3, Sort4, TripleBlock};
pub use crate::store::{BlockStore, FileUnit, OpenMode, units};
pub use crate::structs::*;

/* #endregion */

/* #region for developers */

// RSTSR backend specification
#[cfg(not(feature = "use_openblas"))]
pub(crate) type DeviceTsr = DeviceFaer;
#[cfg(feature = "use_openblas")]
pub(crate) type DeviceTsr = DeviceOpenBLAS;

pub(crate) use anyhow::{Context, Result, bail, format_err};
pub(crate) use itertools::{Itertools, iproduct, izip};
pub(crate) use log::{debug, info, trace, warn};
pub(crate) use rayon::prelude::*;
pub(crate) use rstsr::prelude::*;

pub(crate) use crate::*;

pub(crate) type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub(crate) type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;
pub(crate) type TsrMut<'a, D = IxD> = TensorMut<'a, f64, DeviceTsr, D>;

/* #endregion */
