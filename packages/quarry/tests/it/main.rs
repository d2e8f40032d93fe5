use std::sync::Arc;

use quarry::cas::MemoryStore;

pub mod action;
pub mod engine;
pub mod tree;

#[track_caller]
pub fn memory_store() -> Arc<MemoryStore> {
    let _ = color_eyre::install();
    Arc::new(MemoryStore::new())
}

/// Deterministic pseudo-random bytes for fixture files.
pub fn patterned_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
