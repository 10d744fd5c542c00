//! Engine context and tensor handles.
//!
//! A [`DpdContext`] owns the orbital spaces, the block store, the memory
//! budget and the dense-algebra device. Tensor handles ([`Buf4`], [`File2`])
//! borrow the context; nothing in the engine is global.

use crate::cache::{BlockMatrix, BucketPlan, MemoryBudget};
use crate::descriptor::{Buf4Params, File2Params, PairIndex, PairSpec};
use crate::irrep::{Irrep, compose};
use crate::mospace::{SpaceId, SpaceRegistry};
use crate::prelude::*;
use crate::store::{BlockStore, FileUnit};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/* #region context */

pub struct DpdContext {
    spaces: SpaceRegistry,
    store: BlockStore,
    memory: Arc<MemoryBudget>,
    device: DeviceTsr,
    pairs: Mutex<HashMap<PairSpec, Arc<PairIndex>>>,
}

impl DpdContext {
    pub fn new(spaces: SpaceRegistry, store: BlockStore, memory: MemoryBudget) -> Self {
        Self {
            spaces,
            store,
            memory: Arc::new(memory),
            device: DeviceTsr::default(),
            pairs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(spaces: SpaceRegistry, config: &DpdConfig) -> Result<Self> {
        let store = BlockStore::new(&config.scratch_dir, &config.file_prefix)?;
        info!(
            "DPD context: {} irreps, memory {:.1} MiB, scratch {}",
            spaces.nirrep(),
            config.memory_mb,
            config.scratch_dir.display()
        );
        Ok(Self::new(spaces, store, MemoryBudget::from_megabytes(config.memory_mb)))
    }

    pub fn nirrep(&self) -> usize {
        self.spaces.nirrep()
    }

    pub fn spaces(&self) -> &SpaceRegistry {
        &self.spaces
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn memory(&self) -> &Arc<MemoryBudget> {
        &self.memory
    }

    pub fn device(&self) -> &DeviceTsr {
        &self.device
    }

    pub fn pair_index(&self, spec: PairSpec) -> Result<Arc<PairIndex>> {
        let mut pairs = self.pairs.lock().map_err(|_| format_err!("pair index table lock poisoned"))?;
        if let Some(index) = pairs.get(&spec) {
            return Ok(index.clone());
        }
        let index = Arc::new(PairIndex::new(spec, &self.spaces)?);
        pairs.insert(spec, index.clone());
        Ok(index)
    }

    fn buf4_params(&self, sym: Irrep, row: &str, col: &str) -> Result<Buf4Params> {
        if sym >= self.nirrep() {
            bail!("tensor irrep {sym} out of range for {} irreps", self.nirrep());
        }
        let row = self.pair_index(PairSpec::parse(row)?)?;
        let col = self.pair_index(PairSpec::parse(col)?)?;
        Ok(Buf4Params { row, col, sym })
    }

    /// Handle on a 4-index tensor stored with layout `stored` and read through
    /// layout `mem`, optionally antisymmetrized in its last two indices on read.
    pub fn buf4(
        &self,
        file: FileUnit,
        sym: Irrep,
        mem: (&str, &str),
        stored: (&str, &str),
        anti: bool,
        label: &str,
    ) -> Result<Buf4<'_>> {
        let params = self.buf4_params(sym, mem.0, mem.1)?;
        let stored = self.buf4_params(sym, stored.0, stored.1)?;
        let spaces = |spec: PairSpec| [spec.p, spec.q];
        if spaces(params.row.spec()) != spaces(stored.row.spec()) || spaces(params.col.spec()) != spaces(stored.col.spec())
        {
            bail!(
                "layouts {},{} and {},{} of '{label}' index different spaces",
                params.row.spec(),
                params.col.spec(),
                stored.row.spec(),
                stored.col.spec()
            );
        }
        if anti && stored.col.spec().p != stored.col.spec().q {
            bail!("'{label}' cannot be antisymmetrized over {}", stored.col.spec());
        }
        Ok(Buf4 { ctx: self, file, label: label.to_string(), params, stored, anti })
    }

    /// Handle on a 4-index tensor read and written in its stored layout.
    pub fn buf4_plain(&self, file: FileUnit, sym: Irrep, row: &str, col: &str, label: &str) -> Result<Buf4<'_>> {
        self.buf4(file, sym, (row, col), (row, col), false, label)
    }

    pub fn file2(&self, file: FileUnit, sym: Irrep, row: char, col: char, label: &str) -> Result<File2<'_>> {
        let (row, col) = (SpaceId::from_label(row)?, SpaceId::from_label(col)?);
        if sym >= self.nirrep() {
            bail!("tensor irrep {sym} out of range for {} irreps", self.nirrep());
        }
        let params = File2Params {
            row,
            col,
            row_dim: self.spaces.dim(row)?.clone(),
            col_dim: self.spaces.dim(col)?.clone(),
            sym,
        };
        Ok(File2 { ctx: self, file, label: label.to_string(), params })
    }
}

/* #endregion */

/* #region Buf4 */

pub struct Buf4<'a> {
    ctx: &'a DpdContext,
    file: FileUnit,
    label: String,
    params: Buf4Params,
    stored: Buf4Params,
    anti: bool,
}

impl<'a> Buf4<'a> {
    pub fn ctx(&self) -> &'a DpdContext {
        self.ctx
    }

    pub fn file(&self) -> FileUnit {
        self.file
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn params(&self) -> &Buf4Params {
        &self.params
    }

    pub fn sym(&self) -> Irrep {
        self.params.sym
    }

    pub fn nirrep(&self) -> usize {
        self.params.nirrep()
    }

    pub fn rowtot(&self, h: Irrep) -> usize {
        self.params.rowtot(h)
    }

    /// Columns of the block whose rows have irrep `h`.
    pub fn coltot(&self, h: Irrep) -> usize {
        self.params.coltot(h)
    }

    pub fn row_index(&self) -> &PairIndex {
        &self.params.row
    }

    pub fn col_index(&self) -> &PairIndex {
        &self.params.col
    }

    /// Whether blocks move between store and memory without conversion.
    pub fn is_direct(&self) -> bool {
        !self.anti && self.params.same_layout(&self.stored)
    }

    pub fn alloc_rows(&self, h: Irrep, rows: usize) -> BlockMatrix {
        self.ctx.memory.zeros(rows, self.coltot(h))
    }

    pub fn alloc_irrep(&self, h: Irrep) -> BlockMatrix {
        self.alloc_rows(h, self.rowtot(h))
    }

    /// Row buckets of irrep `h` for a pass that also holds output rows of `out_width`.
    pub fn bucket_plan(&self, h: Irrep, out_width: usize) -> BucketPlan {
        self.ctx.memory.bucket_plan(self.rowtot(h), self.coltot(h), out_width)
    }

    pub fn read_irrep(&self, h: Irrep) -> Result<BlockMatrix> {
        self.read_rows(h, 0, self.rowtot(h))
    }

    /// Rows `start..start + count` of irrep `h` in the memory layout.
    pub fn read_rows(&self, h: Irrep, start: usize, count: usize) -> Result<BlockMatrix> {
        let mut block = self.alloc_rows(h, count);
        if count == 0 || block.cols() == 0 {
            return Ok(block);
        }
        if self.is_direct() {
            self.ctx.store.read_block_into(self.file, &self.label, h, start, count, block.as_mut_slice())?;
            return Ok(block);
        }

        let hc = compose(h, self.sym());
        let stored_cols = self.stored.coltot(h);
        if self.params.row.spec() == self.stored.row.spec() {
            let raw = self.ctx.store.read_block(self.file, &self.label, h, start, count)?;
            for m in 0..count {
                self.gather_row(hc, &raw[m * stored_cols..(m + 1) * stored_cols], 1.0, block.row_mut(m));
            }
        } else {
            let mut raw = vec![0.0; stored_cols];
            for m in 0..count {
                let [p, q] = self.params.row.pair(h, start + m);
                let Some(slot) = self.stored.row.lookup(p, q) else {
                    continue;
                };
                self.ctx.store.read_block_into(self.file, &self.label, h, slot.index, 1, &mut raw)?;
                self.gather_row(hc, &raw, slot.sign, block.row_mut(m));
            }
        }
        Ok(block)
    }

    /// Fill one memory-layout row from one stored-layout row.
    fn gather_row(&self, hc: Irrep, raw: &[f64], sign: f64, out: &mut [f64]) {
        let stored_col = &self.stored.col;
        let element = |r: usize, s: usize| match stored_col.lookup(r, s) {
            Some(slot) => slot.sign * raw[slot.index],
            None => 0.0,
        };
        for (c, x) in out.iter_mut().enumerate() {
            let [r, s] = self.params.col.pair(hc, c);
            let mut value = element(r, s);
            if self.anti {
                value -= element(s, r);
            }
            *x = sign * value;
        }
    }

    pub fn write_irrep(&self, h: Irrep, block: &BlockMatrix) -> Result<()> {
        self.write_rows(h, 0, block)
    }

    /// Write memory-layout rows starting at `start`; columns are packed if
    /// the stored column layout differs.
    pub fn write_rows(&self, h: Irrep, start: usize, block: &BlockMatrix) -> Result<()> {
        assert!(
            !self.anti && self.params.row.spec() == self.stored.row.spec(),
            "[fatal] '{}' cannot be written through layout {},{}",
            self.label,
            self.params.row.spec(),
            self.params.col.spec()
        );
        let cols = self.coltot(h);
        assert_eq!(block.cols(), cols, "[fatal] block width {} does not match '{}' irrep {h}", block.cols(), self.label);
        if block.rows() == 0 || cols == 0 {
            return Ok(());
        }
        let rows_total = self.rowtot(h);
        if self.params.col.spec() == self.stored.col.spec() {
            return self.ctx.store.write_block(self.file, &self.label, h, start, rows_total, cols, block.as_slice());
        }

        let hc = compose(h, self.sym());
        let stored_cols = self.stored.coltot(h);
        let mut raw = vec![0.0; block.rows() * stored_cols];
        for c in 0..stored_cols {
            let [r, s] = self.stored.col.pair(hc, c);
            let Some(slot) = self.params.col.lookup(r, s) else {
                continue;
            };
            for m in 0..block.rows() {
                raw[m * stored_cols + c] = slot.sign * block.get(m, slot.index);
            }
        }
        self.ctx.store.write_block(self.file, &self.label, h, start, rows_total, stored_cols, &raw)
    }

    /// Element `(p, q, r, s)` in the memory layout, absolute orbital indices.
    ///
    /// Reads one row from the store per call; loops over many elements should
    /// go through [`Buf4::read_all`] or row buckets instead.
    pub fn value(&self, p: usize, q: usize, r: usize, s: usize) -> Result<f64> {
        let Some((h, m, n, sign)) = locate4(&self.params, [p, q, r, s]) else {
            return Ok(0.0);
        };
        let block = self.read_rows(h, m, 1)?;
        Ok(sign * block.get(0, n))
    }

    /// Every irrep block in the memory layout.
    pub fn read_all(&self) -> Result<Buf4Blocks> {
        let blocks = (0..self.nirrep()).map(|h| self.read_irrep(h)).collect::<Result<Vec<_>>>()?;
        Ok(Buf4Blocks { params: self.params.clone(), blocks })
    }

    /// Write every element from a function of absolute orbital indices.
    pub fn write_from_fn(&self, f: impl Fn(usize, usize, usize, usize) -> f64) -> Result<()> {
        for h in 0..self.nirrep() {
            let hc = compose(h, self.sym());
            for (start, count) in self.bucket_plan(h, 0).buckets() {
                let mut block = self.alloc_rows(h, count);
                for m in 0..count {
                    let [p, q] = self.params.row.pair(h, start + m);
                    for (c, x) in block.row_mut(m).iter_mut().enumerate() {
                        let [r, s] = self.params.col.pair(hc, c);
                        *x = f(p, q, r, s);
                    }
                }
                self.write_rows(h, start, &block)?;
            }
        }
        Ok(())
    }

    /// Set every stored element to zero.
    pub fn zero(&self) -> Result<()> {
        self.write_from_fn(|_, _, _, _| 0.0)
    }

    pub fn scale(&self, alpha: f64) -> Result<()> {
        assert!(self.is_direct(), "[fatal] '{}' can only be scaled in its stored layout", self.label);
        for h in 0..self.nirrep() {
            for (start, count) in self.bucket_plan(h, 0).buckets() {
                let mut block = self.read_rows(h, start, count)?;
                block.scale(alpha);
                self.write_rows(h, start, &block)?;
            }
        }
        Ok(())
    }

    pub fn dot(&self, other: &Buf4) -> Result<f64> {
        self.check_same_shape(other);
        let mut total = 0.0;
        for h in 0..self.nirrep() {
            for (start, count) in self.bucket_plan(h, self.coltot(h)).buckets() {
                total += self.read_rows(h, start, count)?.dot(&other.read_rows(h, start, count)?);
            }
        }
        Ok(total)
    }

    /// Copy into a new tensor stored in this handle's memory layout.
    pub fn copy_to(&self, file: FileUnit, label: &str) -> Result<Buf4<'a>> {
        let row = self.params.row.spec().to_string();
        let col = self.params.col.spec().to_string();
        let target = self.ctx.buf4_plain(file, self.sym(), &row, &col, label)?;
        for h in 0..self.nirrep() {
            for (start, count) in self.bucket_plan(h, self.coltot(h)).buckets() {
                target.write_rows(h, start, &self.read_rows(h, start, count)?)?;
            }
        }
        Ok(target)
    }

    pub(crate) fn check_same_shape(&self, other: &Buf4) {
        assert!(
            self.params.same_layout(&other.params),
            "[fatal] '{}' and '{}' have different layouts",
            self.label,
            other.label
        );
    }

    /// Dump all blocks at trace level.
    pub fn print(&self) -> Result<()> {
        if !log::log_enabled!(log::Level::Trace) {
            return Ok(());
        }
        trace!("DPD Buf4: {} (unit {}, irrep {})", self.label, self.file, self.sym());
        trace!("Row and column dimensions for DPD Block:");
        for h in 0..self.nirrep() {
            trace!("   {h}   {:5}   {:5}", self.rowtot(h), self.coltot(h));
        }
        for h in 0..self.nirrep() {
            let block = self.read_irrep(h)?;
            for m in 0..block.rows() {
                let [p, q] = self.params.row.pair(h, m);
                trace!("  irrep {h} ({p:3},{q:3}) {:?}", block.row(m));
            }
        }
        Ok(())
    }
}

/// `(row irrep, row, column, sign)` of element `idx`; `None` when it is zero
/// by symmetry or packing.
fn locate4(params: &Buf4Params, [p, q, r, s]: [usize; 4]) -> Option<(Irrep, usize, usize, f64)> {
    let row = params.row.lookup(p, q)?;
    let col = params.col.lookup(r, s)?;
    if col.irrep != compose(row.irrep, params.sym) {
        return None;
    }
    Some((row.irrep, row.index, col.index, row.sign * col.sign))
}

/// In-memory blocks of a 4-index tensor, one per row irrep.
#[derive(Debug)]
pub struct Buf4Blocks {
    params: Buf4Params,
    blocks: Vec<BlockMatrix>,
}

impl Buf4Blocks {
    pub fn block(&self, h: Irrep) -> &BlockMatrix {
        &self.blocks[h]
    }

    /// Element `(p, q, r, s)`, absolute orbital indices.
    pub fn value(&self, p: usize, q: usize, r: usize, s: usize) -> f64 {
        match locate4(&self.params, [p, q, r, s]) {
            Some((h, m, n, sign)) => sign * self.blocks[h].get(m, n),
            None => 0.0,
        }
    }
}

/* #endregion */

/* #region File2 */

/// In-memory blocks of a 2-index tensor, one per row irrep.
#[derive(Debug)]
pub struct File2Blocks {
    params: File2Params,
    blocks: Vec<BlockMatrix>,
}

impl File2Blocks {
    pub fn sym(&self) -> Irrep {
        self.params.sym
    }

    pub fn nirrep(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, h: Irrep) -> &BlockMatrix {
        &self.blocks[h]
    }

    pub fn block_mut(&mut self, h: Irrep) -> &mut BlockMatrix {
        &mut self.blocks[h]
    }

    /// Element `(i, j)` of block `h`, indices relative to their irreps.
    pub fn get(&self, h: Irrep, i: usize, j: usize) -> f64 {
        self.blocks[h].get(i, j)
    }

    /// Element `(p, q)`, absolute orbital indices.
    pub fn value(&self, p: usize, q: usize) -> f64 {
        let (hp, i) = self.params.row_dim.relative(p);
        let (hq, j) = self.params.col_dim.relative(q);
        if compose(hp, self.params.sym) != hq { 0.0 } else { self.blocks[hp].get(i, j) }
    }

    pub fn dot(&self, other: &File2Blocks) -> f64 {
        izip!(&self.blocks, &other.blocks).map(|(a, b)| a.dot(b)).sum()
    }
}

pub struct File2<'a> {
    ctx: &'a DpdContext,
    file: FileUnit,
    label: String,
    params: File2Params,
}

impl<'a> File2<'a> {
    pub fn ctx(&self) -> &'a DpdContext {
        self.ctx
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn params(&self) -> &File2Params {
        &self.params
    }

    pub fn row_space(&self) -> SpaceId {
        self.params.row
    }

    pub fn col_space(&self) -> SpaceId {
        self.params.col
    }

    pub fn sym(&self) -> Irrep {
        self.params.sym
    }

    pub fn nirrep(&self) -> usize {
        self.params.nirrep()
    }

    pub fn rowtot(&self, h: Irrep) -> usize {
        self.params.rowtot(h)
    }

    pub fn coltot(&self, h: Irrep) -> usize {
        self.params.coltot(h)
    }

    pub fn alloc(&self) -> File2Blocks {
        let blocks = (0..self.nirrep()).map(|h| self.ctx.memory.zeros(self.rowtot(h), self.coltot(h))).collect();
        File2Blocks { params: self.params.clone(), blocks }
    }

    pub fn read(&self) -> Result<File2Blocks> {
        let mut blocks = self.alloc();
        for (h, block) in blocks.blocks.iter_mut().enumerate() {
            if block.is_empty() {
                continue;
            }
            self.ctx.store.read_block_into(self.file, &self.label, h, 0, block.rows(), block.as_mut_slice())?;
        }
        Ok(blocks)
    }

    pub fn write(&self, blocks: &File2Blocks) -> Result<()> {
        for (h, block) in blocks.blocks.iter().enumerate() {
            assert_eq!(
                (block.rows(), block.cols()),
                (self.rowtot(h), self.coltot(h)),
                "[fatal] block {h} does not match '{}'",
                self.label
            );
            if block.is_empty() {
                continue;
            }
            self.ctx.store.write_block(self.file, &self.label, h, 0, block.rows(), block.cols(), block.as_slice())?;
        }
        Ok(())
    }

    /// Element `(p, q)`, absolute orbital indices.
    pub fn value(&self, p: usize, q: usize) -> Result<f64> {
        let (hp, i) = self.params.row_dim.relative(p);
        let (hq, j) = self.params.col_dim.relative(q);
        if compose(hp, self.sym()) != hq {
            return Ok(0.0);
        }
        let row = self.ctx.store.read_block(self.file, &self.label, hp, i, 1)?;
        Ok(row[j])
    }

    /// Write every element from a function of absolute orbital indices.
    pub fn write_from_fn(&self, f: impl Fn(usize, usize) -> f64) -> Result<()> {
        let mut blocks = self.alloc();
        for h in 0..self.nirrep() {
            let hc = compose(h, self.sym());
            for i in 0..self.rowtot(h) {
                for j in 0..self.coltot(h) {
                    let p = self.params.row_dim.absolute(h, i);
                    let q = self.params.col_dim.absolute(hc, j);
                    *blocks.block_mut(h).at_mut(i, j) = f(p, q);
                }
            }
        }
        self.write(&blocks)
    }

    pub fn dot(&self, other: &File2) -> Result<f64> {
        Ok(self.read()?.dot(&other.read()?))
    }

    /// Dump all blocks at trace level.
    pub fn print(&self) -> Result<()> {
        if !log::log_enabled!(log::Level::Trace) {
            return Ok(());
        }
        trace!("DPD File2: {} (unit {}, irrep {})", self.label, self.file, self.sym());
        let blocks = self.read()?;
        for h in 0..self.nirrep() {
            let block = blocks.block(h);
            for i in 0..block.rows() {
                trace!("  irrep {h} row {i:3} {:?}", block.row(i));
            }
        }
        Ok(())
    }
}

/* #endregion */
