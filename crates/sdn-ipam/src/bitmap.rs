//! Fixed-size bit array used as an allocation pool.
//!
//! Bits are numbered most-significant-bit first inside each byte, so bit 0
//! is `0x80` of byte 0. The byte layout is what the cluster store holds.

/// Number of bytes needed to hold `bits` bits.
pub fn byte_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Allocation bitmap over a borrowed byte buffer.
///
/// `capacity` may be smaller than `bytes.len() * 8`; trailing bits are never
/// handed out.
#[derive(Debug)]
pub struct Bitmap<'a> {
    bytes: &'a mut [u8],
    capacity: usize,
}

impl<'a> Bitmap<'a> {
    /// Wraps `bytes`, limiting allocation to the first `capacity` bits.
    pub fn new(bytes: &'a mut [u8], capacity: usize) -> Self {
        let capacity = capacity.min(bytes.len() * 8);
        Self { bytes, capacity }
    }

    /// Number of allocatable bits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if bit `index` is set.
    pub fn is_set(&self, index: usize) -> bool {
        index < self.bytes.len() * 8 && self.bytes[index / 8] & mask(index) != 0
    }

    /// Sets the lowest clear bit and returns its index.
    pub fn test_and_set(&mut self) -> Option<usize> {
        let index = (0..self.capacity).find(|&i| !self.is_set(i))?;
        self.bytes[index / 8] |= mask(index);
        Some(index)
    }

    /// Clears bit `index`. Clearing a clear bit is a no-op.
    pub fn clear(&mut self, index: usize) {
        if index < self.bytes.len() * 8 {
            self.bytes[index / 8] &= !mask(index);
        }
    }

    /// Number of set bits within capacity.
    pub fn count_set(&self) -> usize {
        (0..self.capacity).filter(|&i| self.is_set(i)).count()
    }
}

fn mask(index: usize) -> u8 {
    0x80 >> (index % 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len() {
        assert_eq!(byte_len(4096), 512);
        assert_eq!(byte_len(254), 32);
        assert_eq!(byte_len(1), 1);
        assert_eq!(byte_len(0), 0);
    }

    #[test]
    fn test_msb_first_layout() {
        let mut bytes = vec![0u8; 2];
        let mut bitmap = Bitmap::new(&mut bytes, 16);

        assert_eq!(bitmap.test_and_set(), Some(0));
        assert_eq!(bitmap.test_and_set(), Some(1));
        assert_eq!(bytes, vec![0xC0, 0x00]);
    }

    #[test]
    fn test_lowest_clear_bit_is_reused() {
        let mut bytes = vec![0xFF, 0xFF];
        let mut bitmap = Bitmap::new(&mut bytes, 16);

        bitmap.clear(9);
        assert!(!bitmap.is_set(9));
        assert_eq!(bitmap.test_and_set(), Some(9));
        assert_eq!(bitmap.test_and_set(), None);
    }

    #[test]
    fn test_capacity_limits_allocation() {
        let mut bytes = vec![0xF0];
        let mut bitmap = Bitmap::new(&mut bytes, 5);

        assert_eq!(bitmap.test_and_set(), Some(4));
        assert_eq!(bitmap.test_and_set(), None);
        assert_eq!(bitmap.count_set(), 5);
    }

    #[test]
    fn test_clear_out_of_bounds_is_ignored() {
        let mut bytes = vec![0x80];
        let mut bitmap = Bitmap::new(&mut bytes, 8);
        bitmap.clear(100);
        assert!(bitmap.is_set(0));
    }
}
