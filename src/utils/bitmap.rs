//! Bitmap data structure helper for per-replica reply bookkeeping.

use std::fmt;

use crate::utils::TripStoreError;

use fixedbitset::FixedBitSet;

/// Majority quorum size among `population` replicas.
#[inline]
pub fn quorum_size(population: u8) -> u8 {
    population / 2 + 1
}

/// Compact bitmap for u8 ID -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Sets bit at index to given flag. Returns the previous flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<bool, TripStoreError> {
        if idx as usize >= self.0.len() {
            return Err(TripStoreError(format!("index {} out of bound", idx)));
        }
        let old = self.0[idx as usize];
        self.0.set(idx as usize, flag);
        Ok(old)
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, TripStoreError> {
        if idx as usize >= self.0.len() {
            return Err(TripStoreError(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }
}

/// Iterator over `Bitmap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (u8, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx < self.map.0.len() {
            let id = self.idx;
            self.idx += 1;
            Some((id as u8, self.map.0[id]))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn bitmap_new_panic() {
        Bitmap::new(0, true);
    }

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(7, false);
        assert_eq!(map.set(0, true), Ok(false));
        assert_eq!(map.set(0, true), Ok(true));
        assert!(map.set(1, false).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert!(map.get(7).is_err());
    }

    #[test]
    fn bitmap_count() {
        let mut map = Bitmap::new(5, false);
        assert_eq!(map.count(), 0);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(2, true).is_ok());
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn bitmap_iter_debug() {
        let mut map = Bitmap::new(4, true);
        assert!(map.set(2, false).is_ok());
        let flags: Vec<bool> = map.iter().map(|(_, f)| f).collect();
        assert_eq!(flags, vec![true, true, false, true]);
        assert_eq!(format!("{:?}", map), "{4; [0, 1, 3]}");
    }

    #[test]
    fn quorum_arithmetic() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }
}
