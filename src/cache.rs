//! In-memory blocks, memory accounting and row bucketing.

use crate::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/* #region memory budget */

/// Memory budget counted in doubles.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: AtomicUsize::new(0) }
    }

    pub fn from_megabytes(mb: f64) -> Self {
        Self::new((mb * 1024.0 * 1024.0 / 8.0) as usize)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn free(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn lease(self: &Arc<Self>, size: usize) -> MemoryLease {
        let used = self.used.fetch_add(size, Ordering::Relaxed) + size;
        if used > self.limit {
            warn!("memory budget exceeded: {used} doubles in use, limit {}", self.limit);
        }
        MemoryLease { budget: self.clone(), size }
    }

    /// Zero-filled block accounted against this budget.
    pub fn zeros(self: &Arc<Self>, rows: usize, cols: usize) -> BlockMatrix {
        let mut block = BlockMatrix::zeros(rows, cols);
        block.lease = Some(self.lease(rows * cols));
        block
    }

    /// Bucket plan for streaming `row_total` rows of width `in_width` into
    /// rows of width `out_width`, with the remaining budget.
    pub fn bucket_plan(&self, row_total: usize, in_width: usize, out_width: usize) -> BucketPlan {
        let memfree = self.free().saturating_sub(in_width + out_width);
        BucketPlan::new(row_total, in_width.max(out_width), memfree)
    }
}

/// Doubles held against a budget; returned on drop.
#[derive(Debug)]
pub struct MemoryLease {
    budget: Arc<MemoryBudget>,
    size: usize,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.size, Ordering::Relaxed);
    }
}

/* #endregion */

/* #region BlockMatrix */

/// Dense row-major block of one irrep (or a row range of one).
#[derive(Debug)]
pub struct BlockMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    lease: Option<MemoryLease>,
}

impl BlockMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols], lease: None }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "[fatal] {} doubles cannot form a {rows}x{cols} block", data.len());
        Self { rows, cols, data, lease: None }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// True when the block holds no element.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(mut self) -> Vec<f64> {
        std::mem::take(&mut self.data)
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn at_mut(&mut self, r: usize, c: usize) -> &mut f64 {
        &mut self.data[r * self.cols + c]
    }

    pub fn scale(&mut self, alpha: f64) {
        if alpha == 0.0 {
            self.data.fill(0.0);
        } else if alpha != 1.0 {
            self.data.iter_mut().for_each(|x| *x *= alpha);
        }
    }

    pub fn dot(&self, other: &BlockMatrix) -> f64 {
        assert_eq!(
            (self.rows, self.cols),
            (other.rows, other.cols),
            "[fatal] dot product of blocks with different shapes"
        );
        izip!(&self.data, &other.data).map(|(a, b)| a * b).sum()
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &BlockMatrix) {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols), "[fatal] axpy of blocks with different shapes");
        izip!(&mut self.data, &other.data).for_each(|(a, b)| *a += alpha * b);
    }

    pub fn mat(&self) -> MatRef<'_> {
        MatRef::new(&self.data, self.rows, self.cols)
    }

    pub fn mat_mut(&mut self) -> MatMut<'_> {
        MatMut::new(&mut self.data, self.rows, self.cols)
    }

    /// Rows `start..start + count` as a matrix.
    pub fn mat_rows(&self, start: usize, count: usize) -> MatRef<'_> {
        MatRef::new(&self.data[start * self.cols..(start + count) * self.cols], count, self.cols)
    }

    pub fn mat_rows_mut(&mut self, start: usize, count: usize) -> MatMut<'_> {
        let cols = self.cols;
        MatMut::new(&mut self.data[start * cols..(start + count) * cols], count, cols)
    }

    /// Return the block and its memory to the budget.
    pub fn release(self) {}
}

/// Borrowed contiguous row-major matrix.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    pub data: &'a [f64],
    pub rows: usize,
    pub cols: usize,
}

impl<'a> MatRef<'a> {
    pub fn new(data: &'a [f64], rows: usize, cols: usize) -> Self {
        assert!(data.len() >= rows * cols, "[fatal] {} doubles cannot back a {rows}x{cols} matrix", data.len());
        Self { data: &data[..rows * cols], rows, cols }
    }
}

#[derive(Debug)]
pub struct MatMut<'a> {
    pub data: &'a mut [f64],
    pub rows: usize,
    pub cols: usize,
}

impl<'a> MatMut<'a> {
    pub fn new(data: &'a mut [f64], rows: usize, cols: usize) -> Self {
        assert!(data.len() >= rows * cols, "[fatal] {} doubles cannot back a {rows}x{cols} matrix", data.len());
        Self { data: &mut data[..rows * cols], rows, cols }
    }
}

/* #endregion */

/* #region bucket plan */

/// Split of an irrep's rows into contiguous buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPlan {
    pub row_total: usize,
    pub rows_per_bucket: usize,
    pub n_buckets: usize,
}

impl BucketPlan {
    /// Buckets such that `rows_per_bucket * row_width * 2` fits in `memfree`
    /// doubles; at least one row per bucket.
    pub fn new(row_total: usize, row_width: usize, memfree: usize) -> Self {
        if row_total == 0 || row_width == 0 {
            return Self { row_total, rows_per_bucket: 0, n_buckets: 0 };
        }
        let fit = memfree / (2 * row_width);
        if fit == 0 {
            warn!("memory budget holds less than one row of width {row_width}; processing one row at a time");
        }
        let rows_per_bucket = fit.clamp(1, row_total);
        Self { row_total, rows_per_bucket, n_buckets: row_total.div_ceil(rows_per_bucket) }
    }

    /// All rows in one bucket.
    pub fn single(row_total: usize) -> Self {
        match row_total {
            0 => Self { row_total, rows_per_bucket: 0, n_buckets: 0 },
            _ => Self { row_total, rows_per_bucket: row_total, n_buckets: 1 },
        }
    }

    /// `(row_start, row_count)` of bucket `n`; the last bucket takes the remainder.
    pub fn bucket(&self, n: usize) -> (usize, usize) {
        let start = n * self.rows_per_bucket;
        (start, self.rows_per_bucket.min(self.row_total - start))
    }

    pub fn buckets(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.n_buckets).map(|n| self.bucket(n))
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bucket_plan() {
        let plan = BucketPlan::new(10, 3, 24);
        assert_eq!((plan.rows_per_bucket, plan.n_buckets), (4, 3));
        assert_eq!(plan.buckets().collect::<Vec<_>>(), vec![(0, 4), (4, 4), (8, 2)]);

        // remainder zero: last bucket is full, not empty
        let plan = BucketPlan::new(8, 3, 24);
        assert_eq!(plan.buckets().collect::<Vec<_>>(), vec![(0, 4), (4, 4)]);

        // enough memory for everything
        let plan = BucketPlan::new(8, 3, 1 << 20);
        assert_eq!(plan, BucketPlan::single(8));

        // zero extents give no buckets
        assert_eq!(BucketPlan::new(0, 3, 100).n_buckets, 0);
        assert_eq!(BucketPlan::new(5, 0, 100).n_buckets, 0);

        // budget smaller than one row
        let plan = BucketPlan::new(3, 100, 10);
        assert_eq!(plan.buckets().collect::<Vec<_>>(), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn test_budget_bucket_plan_subtracts_widths() {
        let budget = MemoryBudget::new(100);
        // (100 - 5 - 5) / (2 * 5) = 9
        let plan = budget.bucket_plan(20, 5, 5);
        assert_eq!((plan.rows_per_bucket, plan.n_buckets), (9, 3));
    }

    #[test]
    fn test_lease_released_on_all_paths() {
        let budget = Arc::new(MemoryBudget::new(1000));
        {
            let block = budget.zeros(10, 10);
            assert_eq!(budget.used(), 100);
            let other = budget.zeros(2, 5);
            assert_eq!(budget.used(), 110);
            other.release();
            assert_eq!(budget.used(), 100);
            drop(block);
        }
        assert_eq!(budget.used(), 0);

        let failing = |budget: &Arc<MemoryBudget>| -> Result<()> {
            let _block = budget.zeros(4, 4);
            bail!("early exit");
        };
        assert!(failing(&budget).is_err());
        assert_eq!(budget.used(), 0);

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _block = budget.zeros(3, 3);
            panic!("[fatal] test");
        }));
        assert!(caught.is_err());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_block_helpers() {
        let mut a = BlockMatrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = BlockMatrix::from_vec(2, 3, vec![1.0; 6]);
        assert_eq!(a.dot(&b), 21.0);
        a.axpy(2.0, &b);
        assert_eq!(a.row(1), &[6.0, 7.0, 8.0]);
        a.scale(0.5);
        assert_eq!(a.get(0, 2), 2.5);
        assert_eq!(a.mat_rows(1, 1).data, &[3.0, 3.5, 4.0]);
    }
}
