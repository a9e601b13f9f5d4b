use std::hash::Hasher;

const OFFSET_BASIS_32: u32 = 2166136261;

const FNV_PRIME_32: u32 = 16777619;

// Alphabet used by kubernetes to render hashes without vowels or confusable characters.
const SAFE_ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    Fnv1,
    Fnv1a,
}

/// An FNV hasher suitable to match kubernetes'
pub struct FnvHasher {
    hash: u32,
    variant: Variant,
}

impl FnvHasher {
    /// FNV-1, as used for controller revision hashes.
    pub fn new_32() -> Self {
        FnvHasher {
            hash: OFFSET_BASIS_32,
            variant: Variant::Fnv1,
        }
    }

    pub fn new_32a() -> Self {
        FnvHasher {
            hash: OFFSET_BASIS_32,
            variant: Variant::Fnv1a,
        }
    }

    pub fn finish_32(&self) -> u32 {
        self.hash
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let mut hash = self.hash;
        for byte in bytes {
            match self.variant {
                Variant::Fnv1 => {
                    hash = hash.wrapping_mul(FNV_PRIME_32);
                    hash ^= *byte as u32;
                }
                Variant::Fnv1a => {
                    hash ^= *byte as u32;
                    hash = hash.wrapping_mul(FNV_PRIME_32);
                }
            }
        }
        self.hash = hash;
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.hash.into()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.write(bytes)
    }
}

/// Map every byte onto the safe alphabet.
pub fn safe_encode_string(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHANUMS[b as usize % SAFE_ALPHANUMS.len()] as char)
        .collect()
}

/// Hash some serialized data together with a collision count, rendered the way kubernetes renders
/// controller revision hashes.
pub fn hash_with_collision_count(data: &[u8], collision_count: Option<i32>) -> String {
    let mut hasher = FnvHasher::new_32();
    hasher.write(data);
    if let Some(count) = collision_count {
        hasher.write(&(count as u32).to_le_bytes());
    }
    safe_encode_string(&hasher.finish_32().to_string())
}

