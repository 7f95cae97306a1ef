use bit_vec::BitVec;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Bloom filter attached to each sorted-run file so point reads can skip
/// runs that cannot contain the key
#[derive(Debug, Clone)]
pub struct BloomFilter {
    pub no_of_hash_func: usize,
    pub bits: BitVec,
}

impl BloomFilter {
    pub fn new(false_positive_rate: f64, no_of_elements: usize) -> Self {
        assert!(
            false_positive_rate > 0.0,
            "False positive rate can not be less than or equal to zero"
        );
        let no_of_elements = no_of_elements.max(1);
        let no_of_bits = Self::calculate_no_of_bits(no_of_elements, false_positive_rate);
        let no_of_hash_func = Self::calculate_no_of_hash_function(no_of_bits, no_of_elements as u32) as usize;
        Self {
            no_of_hash_func,
            bits: BitVec::from_elem(no_of_bits as usize, false),
        }
    }

    pub fn set<K: AsRef<[u8]>>(&mut self, key: K) {
        let len = self.bits.len();
        for i in 0..self.no_of_hash_func {
            let hash = Self::calculate_hash(key.as_ref(), i);
            self.bits.set((hash % len as u64) as usize, true);
        }
    }

    pub fn contains<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let len = self.bits.len();
        for i in 0..self.no_of_hash_func {
            let hash = Self::calculate_hash(key.as_ref(), i);
            if !self.bits[(hash % len as u64) as usize] {
                return false;
            }
        }
        true
    }

    /// Serialized form stored in the run file's bloom section
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    pub fn from_bytes(no_of_hash_func: usize, bytes: &[u8]) -> Self {
        Self {
            no_of_hash_func,
            bits: BitVec::from_bytes(bytes),
        }
    }

    fn calculate_hash<K: AsRef<[u8]>>(key: K, seed: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.as_ref().hash(&mut hasher);
        hasher.write_u64(seed as u64);
        hasher.finish()
    }

    fn calculate_no_of_bits(no_of_elements: usize, false_positive_rate: f64) -> u32 {
        let no_bits = -((no_of_elements as f64 * false_positive_rate.ln()) / (2_f64.ln()).powi(2));
        no_bits.ceil().max(8.0) as u32
    }

    fn calculate_no_of_hash_function(no_of_bits: u32, no_of_elements: u32) -> u32 {
        let no_hash_func = (no_of_bits as f64 / no_of_elements as f64) * 2_f64.ln();
        no_hash_func.ceil().max(1.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_contains() {
        let mut bf = BloomFilter::new(0.01, 100);
        for i in 0..100u32 {
            bf.set(i.to_be_bytes());
        }
        for i in 0..100u32 {
            assert!(bf.contains(i.to_be_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut bf = BloomFilter::new(0.01, 1000);
        for i in 0..1000u32 {
            bf.set(i.to_be_bytes());
        }
        let mut false_positives = 0;
        for i in 1000..11000u32 {
            if bf.contains(i.to_be_bytes()) {
                false_positives += 1;
            }
        }
        assert!(false_positives < 500, "false positive count {}", false_positives);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut bf = BloomFilter::new(0.01, 10);
        bf.set(b"hello");
        let restored = BloomFilter::from_bytes(bf.no_of_hash_func, &bf.to_bytes());
        assert!(restored.contains(b"hello"));
    }
}
