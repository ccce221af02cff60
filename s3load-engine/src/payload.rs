//! Randomized object contents.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Payloads of at least this many bytes are filled on the blocking thread pool.
pub const BLOCKING_FILL_THRESHOLD: usize = 1024 * 1024;

/// Produces pseudo-random payloads for uploaded objects.
///
/// The generator owns one RNG that is seeded exactly once. Producing a payload only locks that RNG
/// long enough to draw a seed for a payload-local RNG, so concurrent workers fill their buffers in
/// parallel. The contents are opaque filler and not suitable for anything security related.
#[derive(Debug)]
pub struct PayloadGenerator {
    rng: Mutex<SmallRng>,
}

impl PayloadGenerator {
    /// Creates a generator with a random seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Creates a generator with a fixed seed, producing a reproducible sequence of payloads.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn next_seed(&self) -> u64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.next_u64(),
            Err(poisoned) => poisoned.into_inner().next_u64(),
        }
    }

    /// Returns a freshly allocated payload of `size` bytes.
    pub fn generate(&self, size: usize) -> Bytes {
        self.fill(&mut BytesMut::new(), size)
    }

    /// Fills a payload of `size` bytes using `scratch` as backing storage.
    ///
    /// The scratch buffer reclaims its previous allocation when every payload handed out from it
    /// has been dropped. As long as an earlier payload is still referenced, for example by an
    /// upload that has not finished, a new allocation is made instead, so no payload is ever
    /// overwritten while it is being read.
    pub fn fill(&self, scratch: &mut BytesMut, size: usize) -> Bytes {
        fill_seeded(self.next_seed(), scratch, size)
    }

    /// Like [`fill`](Self::fill), but keeps large fills off the async worker threads.
    ///
    /// Payloads of [`BLOCKING_FILL_THRESHOLD`] bytes or more are filled on the blocking thread pool
    /// while the calling task is suspended. Smaller payloads are filled in place. The sequence of
    /// payloads is the same either way.
    pub async fn fill_async(&self, scratch: &mut BytesMut, size: usize) -> Bytes {
        if size < BLOCKING_FILL_THRESHOLD {
            return self.fill(scratch, size);
        }

        let seed = self.next_seed();
        let mut buffer = std::mem::take(scratch);
        let filled = tokio::task::spawn_blocking(move || {
            let payload = fill_seeded(seed, &mut buffer, size);
            (buffer, payload)
        })
        .await;

        match filled {
            Ok((buffer, payload)) => {
                *scratch = buffer;
                payload
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // the blocking pool is shutting down with the runtime
            Err(_) => fill_seeded(seed, scratch, size),
        }
    }
}

fn fill_seeded(seed: u64, scratch: &mut BytesMut, size: usize) -> Bytes {
    scratch.clear();
    scratch.reserve(size);
    scratch.resize(size, 0);
    SmallRng::seed_from_u64(seed).fill_bytes(scratch);
    scratch.split().freeze()
}

impl Default for PayloadGenerator {
    fn default() -> Self {
        Self::new()
    }
}
