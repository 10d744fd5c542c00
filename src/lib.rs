#![allow(clippy::too_many_arguments)]

pub mod prelude;

pub mod cache;
pub mod ci_ints;
pub mod contract;
pub mod descriptor;
pub mod engine;
pub mod irrep;
pub mod moinfo;
pub mod mospace;
pub mod semicanonical;
pub mod sort;
pub mod store;
pub mod structs;
pub mod tpdm;
pub mod triples;
pub mod util;
