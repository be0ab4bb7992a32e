//! Fixed-capacity index set. Tracks member ranks in suspicion handling
//! and block numbers during bulk-transfer reassembly, where indices are
//! dense, small, and bounded by a size known up front.

use std::fmt;

use fixedbitset::FixedBitSet;

/// A set of indices drawn from `0..capacity`.
///
/// Out-of-range queries answer `false`; out-of-range mutations panic,
/// since the capacity is fixed by the view size or block count and a
/// larger index means the caller's bookkeeping is already broken.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: FixedBitSet,
}

impl Bitmap {
    /// An empty set covering indices `0..capacity`.
    pub fn new(capacity: usize) -> Bitmap {
        assert!(capacity > 0, "bitmap needs nonzero capacity");
        Bitmap {
            bits: FixedBitSet::with_capacity(capacity),
        }
    }

    /// Number of indices the set covers.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    /// Adds an index; returns true if it was not present before.
    #[inline]
    pub fn insert(&mut self, idx: usize) -> bool {
        assert!(
            idx < self.capacity(),
            "index {} outside bitmap capacity {}",
            idx,
            self.capacity()
        );
        !self.bits.put(idx)
    }

    /// Drops an index from the set.
    #[inline]
    pub fn remove(&mut self, idx: usize) {
        assert!(
            idx < self.capacity(),
            "index {} outside bitmap capacity {}",
            idx,
            self.capacity()
        );
        self.bits.set(idx, false);
    }

    /// Is the index in the set?
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.bits.contains(idx)
    }

    /// Number of indices currently in the set.
    #[inline]
    pub fn count(&self) -> usize {
        self.bits.count_ones(..)
    }

    /// Does the set hold every index it covers?
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// The indices in the set, ascending.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.ones()
    }

    /// The lowest covered index NOT in the set, if any.
    pub fn first_zero(&self) -> Option<usize> {
        (0..self.capacity()).find(|&idx| !self.bits.contains(idx))
    }
}

// show only the set indices; capacity alone says little in a trace
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}{:?}", self.count(), self.capacity(), {
            self.ones().collect::<Vec<usize>>()
        })
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn zero_capacity_rejected() {
        Bitmap::new(0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_insert_panics() {
        let mut set = Bitmap::new(4);
        set.insert(4);
    }

    #[test]
    fn insert_reports_novelty() {
        let mut set = Bitmap::new(8);
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert!(!set.contains(99)); // out of range reads as absent
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn fills_up_and_drains() {
        let mut set = Bitmap::new(3);
        for idx in 0..3 {
            assert!(!set.is_full());
            set.insert(idx);
        }
        assert!(set.is_full());
        assert_eq!(set.first_zero(), None);
        set.remove(1);
        assert!(!set.is_full());
        assert_eq!(set.first_zero(), Some(1));
        assert_eq!(set.ones().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn debug_lists_members() {
        let mut set = Bitmap::new(5);
        set.insert(0);
        set.insert(4);
        assert_eq!(format!("{:?}", set), "2/5[0, 4]");
    }
}
