//! Orbital subspaces and their compatibility table.

use crate::irrep::{Dimension, Irrep};
use crate::prelude::*;

/// Identifier of an orbital subspace.
///
/// Each subspace has a one-character label, used in composite-index strings
/// such as `[O>O]-` or `[A,a]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpaceId {
    AlphaOcc,
    BetaOcc,
    AlphaVir,
    BetaVir,
    AlphaMo,
    BetaMo,
    So,
    Active,
}

impl SpaceId {
    pub const ALL: [SpaceId; 8] = [
        SpaceId::AlphaOcc,
        SpaceId::BetaOcc,
        SpaceId::AlphaVir,
        SpaceId::BetaVir,
        SpaceId::AlphaMo,
        SpaceId::BetaMo,
        SpaceId::So,
        SpaceId::Active,
    ];

    pub fn label(self) -> char {
        match self {
            SpaceId::AlphaOcc => 'O',
            SpaceId::BetaOcc => 'o',
            SpaceId::AlphaVir => 'V',
            SpaceId::BetaVir => 'v',
            SpaceId::AlphaMo => 'A',
            SpaceId::BetaMo => 'a',
            SpaceId::So => 'n',
            SpaceId::Active => 'X',
        }
    }

    pub fn from_label(label: char) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.label() == label)
            .ok_or_else(|| format_err!("unknown orbital subspace label '{label}'"))
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Index tags used when no explicit tags are given.
    pub fn default_tags(self) -> &'static [&'static str] {
        match self {
            SpaceId::AlphaOcc => &["I", "J", "K", "L"],
            SpaceId::BetaOcc => &["i", "j", "k", "l"],
            SpaceId::AlphaVir => &["A", "B", "C", "D"],
            SpaceId::BetaVir => &["a", "b", "c", "d"],
            SpaceId::AlphaMo => &["P", "Q", "R", "S"],
            SpaceId::BetaMo => &["p", "q", "r", "s"],
            SpaceId::So => &["m", "n"],
            SpaceId::Active => &["X", "Y"],
        }
    }
}

/// Spin block of an unrestricted reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Spin {
    Alpha,
    Beta,
}

impl Spin {
    pub fn occ(self) -> SpaceId {
        match self {
            Spin::Alpha => SpaceId::AlphaOcc,
            Spin::Beta => SpaceId::BetaOcc,
        }
    }

    pub fn vir(self) -> SpaceId {
        match self {
            Spin::Alpha => SpaceId::AlphaVir,
            Spin::Beta => SpaceId::BetaVir,
        }
    }

    pub fn mo(self) -> SpaceId {
        match self {
            Spin::Alpha => SpaceId::AlphaMo,
            Spin::Beta => SpaceId::BetaMo,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Spin::Alpha => "Alpha",
            Spin::Beta => "Beta",
        }
    }
}

/* #region MOSpace */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MOSpace {
    id: SpaceId,
    tags: Vec<String>,
    dim: Dimension,
    orbsym: Vec<Irrep>,
}

impl MOSpace {
    /// Space with index tags given as a comma separated list, e.g. `"I,J,K,L"`.
    pub fn new(id: SpaceId, tags: &str, dim: Dimension) -> Self {
        let tags = tags.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
        let orbsym = dim.orbsym();
        Self { id, tags, dim, orbsym }
    }

    pub fn with_default_tags(id: SpaceId, dim: Dimension) -> Self {
        Self::new(id, &id.default_tags().join(","), dim)
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn label(&self) -> char {
        self.id.label()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn dim(&self) -> &Dimension {
        &self.dim
    }

    pub fn nirrep(&self) -> usize {
        self.dim.nirrep()
    }

    pub fn n_orb(&self) -> usize {
        self.orbsym.len()
    }

    pub fn orbsym(&self) -> &[Irrep] {
        &self.orbsym
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Index tags shared with another space.
    pub fn overlap(&self, other: &MOSpace) -> Vec<String> {
        self.tags.iter().filter(|t| other.tags.contains(t)).cloned().collect()
    }
}

impl std::fmt::Display for MOSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "MOSpace ID: {}", self.label())?;
        writeln!(f, "MOSpace nIrrep: {}", self.nirrep())?;
        writeln!(f, "MOSpace nOrb: {}", self.n_orb())?;
        writeln!(f, "MOSpace indices: {}", self.tags.join(" "))?;
        writeln!(f, "MOSpace orbPI: {:?}", self.dim.counts())?;
        write!(f, "MOSpace orbSym: {:?}", self.orbsym)
    }
}

/* #endregion */

/* #region SpaceRegistry */

/// The set of subspaces known to an engine context.
#[derive(Debug, Clone)]
pub struct SpaceRegistry {
    nirrep: usize,
    spaces: Vec<Option<MOSpace>>,
    compatible: [[bool; 8]; 8],
}

impl SpaceRegistry {
    pub fn new(nirrep: usize) -> Result<Self> {
        if !crate::irrep::is_valid_nirrep(nirrep) {
            bail!("number of irreps must be 1, 2, 4 or 8, got {nirrep}");
        }
        Ok(Self { nirrep, spaces: vec![None; SpaceId::ALL.len()], compatible: [[false; 8]; 8] })
    }

    pub fn from_spaces(nirrep: usize, spaces: impl IntoIterator<Item = MOSpace>) -> Result<Self> {
        let mut registry = Self::new(nirrep)?;
        for space in spaces {
            registry.register(space)?;
        }
        Ok(registry)
    }

    pub fn nirrep(&self) -> usize {
        self.nirrep
    }

    pub fn register(&mut self, space: MOSpace) -> Result<()> {
        if space.nirrep() != self.nirrep {
            bail!(
                "space '{}' has {} irreps but the context was set up with {}",
                space.label(),
                space.nirrep(),
                self.nirrep
            );
        }
        let idx = space.id().index();
        self.spaces[idx] = Some(space);
        self.rebuild_compatibility();
        Ok(())
    }

    fn rebuild_compatibility(&mut self) {
        for (a, b) in (0..8).cartesian_product(0..8) {
            self.compatible[a][b] = match (&self.spaces[a], &self.spaces[b]) {
                (Some(sa), Some(sb)) => !sa.overlap(sb).is_empty(),
                _ => false,
            };
        }
    }

    pub fn get(&self, id: SpaceId) -> Result<&MOSpace> {
        self.spaces[id.index()].as_ref().ok_or_else(|| format_err!("orbital subspace '{}' is not registered", id.label()))
    }

    pub fn dim(&self, id: SpaceId) -> Result<&Dimension> {
        Ok(self.get(id)?.dim())
    }

    pub fn contains(&self, id: SpaceId) -> bool {
        self.spaces[id.index()].is_some()
    }

    /// Whether an index of space `a` may be contracted against an index of space `b`.
    pub fn compatible(&self, a: SpaceId, b: SpaceId) -> bool {
        self.compatible[a.index()][b.index()]
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_space_labels() {
        for id in SpaceId::ALL {
            assert_eq!(SpaceId::from_label(id.label()).unwrap(), id);
        }
        assert!(SpaceId::from_label('Z').is_err());
    }

    #[test]
    fn test_overlap_and_compatibility() {
        let occ = MOSpace::new(SpaceId::AlphaOcc, "I,J,K,L", Dimension::new(vec![2, 1]).unwrap());
        let vir = MOSpace::new(SpaceId::AlphaVir, "A,B,C,D", Dimension::new(vec![3, 1]).unwrap());
        let act = MOSpace::new(SpaceId::Active, "I,A,X", Dimension::new(vec![5, 2]).unwrap());
        assert_eq!(occ.orbsym(), &[0, 0, 1]);
        assert!(occ.overlap(&vir).is_empty());
        assert_eq!(act.overlap(&vir), vec!["A".to_string()]);

        let registry = SpaceRegistry::from_spaces(2, [occ, vir, act]).unwrap();
        assert!(registry.compatible(SpaceId::AlphaOcc, SpaceId::AlphaOcc));
        assert!(!registry.compatible(SpaceId::AlphaOcc, SpaceId::AlphaVir));
        assert!(registry.compatible(SpaceId::Active, SpaceId::AlphaVir));
        assert!(!registry.compatible(SpaceId::BetaOcc, SpaceId::BetaOcc));
        assert!(registry.get(SpaceId::BetaOcc).is_err());
    }

    #[test]
    fn test_registry_rejects_irrep_mismatch() {
        let mut registry = SpaceRegistry::new(4).unwrap();
        let occ = MOSpace::with_default_tags(SpaceId::AlphaOcc, Dimension::new(vec![2, 1]).unwrap());
        assert!(registry.register(occ).is_err());
        assert!(SpaceRegistry::new(3).is_err());
    }
}
