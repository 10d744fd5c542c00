//! Persistent block store.
//!
//! Each logical unit is a flat file of little-endian doubles in the scratch
//! directory. A table of contents maps `(label, irrep)` to a rectangular
//! record; rows of a record are the addressable granularity.

use crate::irrep::Irrep;
use crate::prelude::*;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub type FileUnit = u32;

/// Unit numbers used by the drivers of this crate.
pub mod units {
    use super::FileUnit;

    pub const MO_INTS: FileUnit = 101;
    pub const AMPLITUDES: FileUnit = 102;
    pub const TPDM_PRESORT: FileUnit = 103;
    pub const TPDM_HALFTRANS: FileUnit = 104;
    pub const SO_TPDM: FileUnit = 105;
    pub const CI_INTS: FileUnit = 106;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from an empty unit, discarding previous contents.
    Create,
    /// Reopen a unit previously closed with `keep = true`.
    Existing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TocEntry {
    label: String,
    irrep: Irrep,
    rows: usize,
    cols: usize,
    offset: u64,
}

#[derive(Debug)]
struct UnitFile {
    file: File,
    toc: Vec<TocEntry>,
    end: u64,
}

impl UnitFile {
    fn entry(&self, label: &str, irrep: Irrep) -> Option<&TocEntry> {
        self.toc.iter().find(|e| e.irrep == irrep && e.label == label)
    }
}

#[derive(Debug)]
pub struct BlockStore {
    dir: PathBuf,
    prefix: String,
    units: Mutex<HashMap<FileUnit, UnitFile>>,
}

impl BlockStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("cannot create scratch directory {}", dir.display()))?;
        Ok(Self { dir, prefix: prefix.to_string(), units: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, unit: FileUnit) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, unit))
    }

    fn toc_path(&self, unit: FileUnit) -> PathBuf {
        self.dir.join(format!("{}.{}.toc", self.prefix, unit))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<FileUnit, UnitFile>>> {
        self.units.lock().map_err(|_| format_err!("block store lock poisoned"))
    }

    pub fn open(&self, unit: FileUnit, mode: OpenMode) -> Result<()> {
        let mut units = self.lock()?;
        if units.contains_key(&unit) {
            bail!("unit {unit} is already open");
        }
        let path = self.path(unit);
        let unit_file = match mode {
            OpenMode::Create => {
                let file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .with_context(|| format!("cannot create unit file {}", path.display()))?;
                let toc_path = self.toc_path(unit);
                if toc_path.exists() {
                    std::fs::remove_file(&toc_path)?;
                }
                UnitFile { file, toc: vec![], end: 0 }
            },
            OpenMode::Existing => {
                let file = File::options()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .with_context(|| format!("cannot open existing unit file {}", path.display()))?;
                let toc_path = self.toc_path(unit);
                let toc: Vec<TocEntry> = if toc_path.exists() {
                    let reader = BufReader::new(File::open(&toc_path)?);
                    bincode::deserialize_from(reader)
                        .map_err(|err| format_err!("corrupted table of contents {}: {err}", toc_path.display()))?
                } else {
                    vec![]
                };
                let end = file.metadata()?.len();
                UnitFile { file, toc, end }
            },
        };
        debug!("Opened unit {unit} ({:?}) at {}", mode, path.display());
        units.insert(unit, unit_file);
        Ok(())
    }

    /// Close a unit; with `keep = false` its contents are erased.
    pub fn close(&self, unit: FileUnit, keep: bool) -> Result<()> {
        let mut units = self.lock()?;
        let Some(mut unit_file) = units.remove(&unit) else {
            bail!("unit {unit} is not open");
        };
        unit_file.file.flush()?;
        drop(unit_file.file);
        if keep {
            let writer = BufWriter::new(File::create(self.toc_path(unit))?);
            bincode::serialize_into(writer, &unit_file.toc)
                .map_err(|err| format_err!("cannot write table of contents of unit {unit}: {err}"))?;
        } else {
            self.remove_files(unit)?;
        }
        debug!("Closed unit {unit} (keep = {keep})");
        Ok(())
    }

    /// Remove the files of a closed unit.
    pub fn erase(&self, unit: FileUnit) -> Result<()> {
        if self.is_open(unit)? {
            bail!("cannot erase unit {unit} while it is open");
        }
        self.remove_files(unit)
    }

    fn remove_files(&self, unit: FileUnit) -> Result<()> {
        for path in [self.path(unit), self.toc_path(unit)] {
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| format!("cannot remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    pub fn is_open(&self, unit: FileUnit) -> Result<bool> {
        Ok(self.lock()?.contains_key(&unit))
    }

    pub fn contains(&self, unit: FileUnit, label: &str, irrep: Irrep) -> Result<bool> {
        let units = self.lock()?;
        let unit_file = units.get(&unit).ok_or_else(|| format_err!("unit {unit} is not open"))?;
        Ok(unit_file.entry(label, irrep).is_some())
    }

    /// Write rows `row_start..row_start + data.len() / cols` of the record
    /// `(label, irrep)`, allocating a `rows_total x cols` record on first write.
    #[allow(clippy::too_many_arguments)]
    pub fn write_block(
        &self,
        unit: FileUnit,
        label: &str,
        irrep: Irrep,
        row_start: usize,
        rows_total: usize,
        cols: usize,
        data: &[f64],
    ) -> Result<()> {
        if cols > 0 && !data.is_empty() {
            if data.len() % cols != 0 {
                bail!("block of {} doubles is not a whole number of rows of width {cols}", data.len());
            }
            let row_end = row_start + data.len() / cols;
            if row_end > rows_total {
                bail!("rows {row_start}..{row_end} exceed the {rows_total} rows of record '{label}'");
            }
        }
        let mut units = self.lock()?;
        let unit_file = units.get_mut(&unit).ok_or_else(|| format_err!("unit {unit} is not open"))?;

        let offset = match unit_file.entry(label, irrep) {
            Some(entry) => {
                if entry.rows != rows_total || entry.cols != cols {
                    bail!(
                        "record '{label}' irrep {irrep} in unit {unit} is {}x{}, cannot write as {rows_total}x{cols}",
                        entry.rows,
                        entry.cols
                    );
                }
                entry.offset
            },
            None => {
                let offset = unit_file.end;
                unit_file.end += (rows_total * cols * 8) as u64;
                unit_file.file.set_len(unit_file.end)?;
                unit_file.toc.push(TocEntry { label: label.to_string(), irrep, rows: rows_total, cols, offset });
                offset
            },
        };

        if cols == 0 || data.is_empty() {
            return Ok(());
        }

        let mut buf = vec![0u8; data.len() * 8];
        LittleEndian::write_f64_into(data, &mut buf);
        unit_file.file.seek(SeekFrom::Start(offset + (row_start * cols * 8) as u64))?;
        unit_file
            .file
            .write_all(&buf)
            .with_context(|| format!("cannot write record '{label}' irrep {irrep} to unit {unit}"))?;
        Ok(())
    }

    /// Read `row_count` rows starting at `row_start` into `out`.
    pub fn read_block_into(
        &self,
        unit: FileUnit,
        label: &str,
        irrep: Irrep,
        row_start: usize,
        row_count: usize,
        out: &mut [f64],
    ) -> Result<()> {
        let mut units = self.lock()?;
        let unit_file = units.get_mut(&unit).ok_or_else(|| format_err!("unit {unit} is not open"))?;
        let entry = unit_file
            .entry(label, irrep)
            .ok_or_else(|| format_err!("record '{label}' irrep {irrep} not found in unit {unit}"))?
            .clone();
        if row_start + row_count > entry.rows {
            bail!("rows {row_start}..{} exceed the {} rows of record '{label}'", row_start + row_count, entry.rows);
        }
        if out.len() != row_count * entry.cols {
            bail!("buffer of {} doubles cannot hold {row_count}x{} block", out.len(), entry.cols);
        }
        if out.is_empty() {
            return Ok(());
        }

        let mut buf = vec![0u8; out.len() * 8];
        unit_file.file.seek(SeekFrom::Start(entry.offset + (row_start * entry.cols * 8) as u64))?;
        unit_file
            .file
            .read_exact(&mut buf)
            .with_context(|| format!("cannot read record '{label}' irrep {irrep} from unit {unit}"))?;
        LittleEndian::read_f64_into(&buf, out);
        Ok(())
    }

    pub fn read_block(&self, unit: FileUnit, label: &str, irrep: Irrep, row_start: usize, row_count: usize) -> Result<Vec<f64>> {
        let cols = self.record_shape(unit, label, irrep)?.1;
        let mut out = vec![0.0; row_count * cols];
        self.read_block_into(unit, label, irrep, row_start, row_count, &mut out)?;
        Ok(out)
    }

    /// `(rows, cols)` of a record.
    pub fn record_shape(&self, unit: FileUnit, label: &str, irrep: Irrep) -> Result<(usize, usize)> {
        let units = self.lock()?;
        let unit_file = units.get(&unit).ok_or_else(|| format_err!("unit {unit} is not open"))?;
        let entry = unit_file
            .entry(label, irrep)
            .ok_or_else(|| format_err!("record '{label}' irrep {irrep} not found in unit {unit}"))?;
        Ok((entry.rows, entry.cols))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::unique_scratch_dir;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f64> {
        (0..n).map(|_| rng.gen_range(-1.0e3..1.0e3)).collect()
    }

    fn bits(v: &[f64]) -> Vec<u64> {
        v.iter().map(|x| x.to_bits()).collect()
    }

    #[test]
    fn test_round_trip_row_ranges() {
        let dir = unique_scratch_dir("store-round-trip");
        let store = BlockStore::new(&dir, "dpd").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (rows, cols) = (11, 5);
        let data = random_vec(&mut rng, rows * cols);

        store.open(units::MO_INTS, OpenMode::Create).unwrap();

        // full irrep
        store.write_block(units::MO_INTS, "full", 0, 0, rows, cols, &data).unwrap();
        assert_eq!(bits(&store.read_block(units::MO_INTS, "full", 0, 0, rows).unwrap()), bits(&data));

        // single row
        let row = &data[3 * cols..4 * cols];
        store.write_block(units::MO_INTS, "single", 2, 3, rows, cols, row).unwrap();
        assert_eq!(bits(&store.read_block(units::MO_INTS, "single", 2, 3, 1).unwrap()), bits(row));

        // several buckets written in one tiling and read back in another
        for (start, count) in [(0, 4), (4, 4), (8, 3)] {
            let chunk = &data[start * cols..(start + count) * cols];
            store.write_block(units::MO_INTS, "tiled", 1, start, rows, cols, chunk).unwrap();
        }
        for (start, count) in [(0, 6), (6, 5)] {
            let chunk = store.read_block(units::MO_INTS, "tiled", 1, start, count).unwrap();
            assert_eq!(bits(&chunk), bits(&data[start * cols..(start + count) * cols]));
        }

        // records of the same file stay independent
        assert_eq!(bits(&store.read_block(units::MO_INTS, "full", 0, 0, rows).unwrap()), bits(&data));
        assert!(store.read_block(units::MO_INTS, "full", 1, 0, 1).is_err());
        assert!(store.read_block(units::MO_INTS, "full", 0, 10, 2).is_err());

        store.close(units::MO_INTS, false).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejected_write_leaves_no_record() {
        let dir = unique_scratch_dir("store-rejected");
        let store = BlockStore::new(&dir, "dpd").unwrap();
        store.open(units::MO_INTS, OpenMode::Create).unwrap();

        // rows 2..5 of a 4-row record
        assert!(store.write_block(units::MO_INTS, "K", 0, 2, 4, 2, &[1.0; 6]).is_err());
        assert!(store.write_block(units::MO_INTS, "K", 0, 0, 4, 2, &[1.0; 3]).is_err());
        assert!(!store.contains(units::MO_INTS, "K", 0).unwrap());
        assert!(store.record_shape(units::MO_INTS, "K", 0).is_err());

        // the record can still be created with a valid write
        store.write_block(units::MO_INTS, "K", 0, 2, 4, 2, &[1.0; 4]).unwrap();
        assert_eq!(store.record_shape(units::MO_INTS, "K", 0).unwrap(), (4, 2));
        assert_eq!(store.read_block(units::MO_INTS, "K", 0, 0, 2).unwrap(), vec![0.0; 4]);

        store.close(units::MO_INTS, false).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_keep_and_erase() {
        let dir = unique_scratch_dir("store-keep");
        let store = BlockStore::new(&dir, "dpd").unwrap();
        let data = vec![1.5, -2.25, 3.0, 0.125];

        store.open(units::AMPLITUDES, OpenMode::Create).unwrap();
        store.write_block(units::AMPLITUDES, "T2", 0, 0, 2, 2, &data).unwrap();
        store.close(units::AMPLITUDES, true).unwrap();
        assert!(store.read_block(units::AMPLITUDES, "T2", 0, 0, 2).is_err());

        store.open(units::AMPLITUDES, OpenMode::Existing).unwrap();
        assert_eq!(store.read_block(units::AMPLITUDES, "T2", 0, 0, 2).unwrap(), data);
        store.close(units::AMPLITUDES, false).unwrap();

        assert!(!store.path(units::AMPLITUDES).exists());
        assert!(store.open(units::AMPLITUDES, OpenMode::Existing).is_err());

        store.open(units::AMPLITUDES, OpenMode::Create).unwrap();
        assert!(!store.contains(units::AMPLITUDES, "T2", 0).unwrap());
        assert!(store.open(units::AMPLITUDES, OpenMode::Create).is_err());
        store.close(units::AMPLITUDES, false).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
