use crate::time::unix_secs;
use byteorder::{ByteOrder, LittleEndian};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha8;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Produces non-guessable 64-bit document ids by running a monotonic
/// counter through a ChaCha8 keystream. The counter plus the wall-clock
/// second is encrypted under a key and nonce drawn from the OS CSPRNG at
/// startup; since the keystream only ever advances, no two ids drawn in one
/// process lifetime can collide at the cipher input. Collisions against
/// documents from earlier process runs are handled by the gateway's
/// insert-retry loop.
pub struct IdGenerator {
    cipher: Mutex<ChaCha8>,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);

        IdGenerator {
            cipher: Mutex::new(ChaCha8::new(&key.into(), &nonce.into())),
            counter: AtomicU64::new(0),
        }
    }

    /// Draw the next id. The mutex only covers one 8-byte keystream
    /// application; the counter itself is a relaxed atomic.
    pub fn next_id(&self) -> i64 {
        let input = self
            .counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(unix_secs());

        let mut data = [0u8; 8];
        LittleEndian::write_u64(&mut data, input);

        {
            let mut cipher = self.cipher.lock().expect("Id cipher poisoned");
            cipher.apply_keystream(&mut data);
        }

        LittleEndian::read_i64(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ids_distinct() {
        let ids = IdGenerator::new();
        let mut seen = HashSet::new();

        for _ in 0..10_000 {
            assert!(seen.insert(ids.next_id()));
        }
    }

    #[test]
    fn test_ids_distinct_across_threads() {
        let ids = Arc::new(IdGenerator::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
    }

    #[test]
    fn test_ids_not_sequential() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();

        // The keystream scrambles adjacent counter values apart.
        assert_ne!(b, a + 1);
    }
}
