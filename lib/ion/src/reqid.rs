use lazy_static::lazy_static;
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of a request id in bytes. Part of the wire format.
pub const REQID_SIZE: usize = 32;

/// Opaque correlator between a request and its response. The all-zero id is
/// reserved for unsolicited messages.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Reqid([u8; REQID_SIZE]);

impl Reqid {
    #[inline]
    pub fn zero() -> Reqid {
        Reqid([0; REQID_SIZE])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; REQID_SIZE]) -> Reqid {
        Reqid(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; REQID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Reqid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

lazy_static! {
    // Process-wide sequence shared by all generators so ids never repeat
    // within one process lifetime.
    static ref SEQUENCE: AtomicU64 = AtomicU64::new(1);
}

/// Produces request ids with negligible collision probability: 24 random
/// bytes fixed per generator followed by an 8-byte process-wide sequence.
pub struct Generator {
    prefix: [u8; REQID_SIZE - 8],
}

impl Generator {
    pub fn new() -> Generator {
        let mut prefix = [0u8; REQID_SIZE - 8];
        rand::thread_rng().fill_bytes(&mut prefix);
        Generator { prefix }
    }

    pub fn generate(&self) -> Reqid {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

        let mut id = [0u8; REQID_SIZE];
        id[..REQID_SIZE - 8].copy_from_slice(&self.prefix);
        id[REQID_SIZE - 8..].copy_from_slice(&seq.to_be_bytes());
        Reqid(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_reserved() {
        assert!(Reqid::zero().is_zero());

        let generator = Generator::new();
        assert!(!generator.generate().is_zero());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let generator = Generator::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generator.generate()));
        }
    }

    #[test]
    fn test_roundtrip_through_bytes() {
        let generator = Generator::new();
        let id = generator.generate();

        assert_eq!(Reqid::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_distinct_generators_do_not_collide() {
        let a = Generator::new();
        let b = Generator::new();

        assert_ne!(a.generate(), b.generate());
    }
}
