use crate::prelude::*;
use npyz::WriterBuilder;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Read a C-ordered `.npy` file of doubles into a row-major tensor.
///
/// # Usage
///
/// ```norun
/// let fock = tensor_from_npy("fock_alpha.npy")?;
/// let f_pq = fock[[p, q]];
/// ```
pub fn tensor_from_npy(path: impl AsRef<Path>) -> Result<Tsr> {
    let path = path.as_ref();
    let device = DeviceTsr::default();
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let npy = npyz::NpyFile::new(&bytes[..]).with_context(|| format!("{} is not an npy file", path.display()))?;
    if npy.order() != npyz::Order::C {
        bail!("{} is Fortran-ordered; only C-ordered arrays are accepted", path.display());
    }
    let shape = npy.shape().iter().map(|&x| x as usize).collect_vec();
    let data: Vec<f64> = npy.into_vec().with_context(|| format!("{} does not hold doubles", path.display()))?;
    Ok(rt::asarray((data, shape.c(), &device)))
}

/// Write a row-major slice of doubles as a C-ordered `.npy` file.
pub fn write_npy(path: impl AsRef<Path>, shape: &[usize], data: &[f64]) -> Result<()> {
    let path = path.as_ref();
    if shape.iter().product::<usize>() != data.len() {
        bail!("{} doubles do not fill an array of shape {shape:?}", data.len());
    }
    let file = std::fs::File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let shape = shape.iter().map(|&x| x as u64).collect_vec();
    let mut writer = npyz::WriteOptions::new().default_dtype().shape(&shape).writer(std::io::BufWriter::new(file)).begin_nd()?;
    writer.extend(data.iter().copied())?;
    writer.finish()?;
    Ok(())
}

/// Fail unless `tensor` has exactly `expected` as its shape.
pub fn check_shape(tensor: &Tsr, expected: &[usize], what: &str) -> Result<()> {
    if tensor.shape() != expected {
        bail!("{what} has shape {:?}, expected {expected:?}", tensor.shape());
    }
    Ok(())
}

/// Fresh directory path below the system temp directory, unique per process and call.
pub fn unique_scratch_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("dpd-{}-{n}-{tag}", std::process::id()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_npy_roundtrip() {
        let dir = unique_scratch_dir("npy");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.npy");
        let data = (0..24).map(|x| x as f64 * 0.5 - 3.0).collect_vec();
        write_npy(&path, &[2, 3, 4], &data).unwrap();

        let t = tensor_from_npy(&path).unwrap();
        assert_eq!(t.shape(), &[2, 3, 4]);
        assert_eq!(t[[1, 2, 3]], data[23]);
        assert_eq!(t[[0, 1, 2]], data[6]);
        check_shape(&t, &[2, 3, 4], "a").unwrap();
        assert!(check_shape(&t, &[4, 3, 2], "a").is_err());
        assert!(write_npy(&path, &[5], &data).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_scratch_dirs_are_unique() {
        assert_ne!(unique_scratch_dir("x"), unique_scratch_dir("x"));
    }
}
