use std::cell::RefCell;

use rand::RngCore;

thread_local! {
    static RNG: RefCell<u64> = RefCell::new(0x123456789ABCDEF);
}

/// Deterministic LCG used only by the bit-pattern fuzz-lite loops in
/// `#[cfg(test)]` modules, where reproducibility across runs matters more
/// than statistical quality.
pub fn rand(modulus: u128) -> u8 {
    if modulus == 0 {
        return 0;
    }

    RNG.with(|rng| {
        let mut state = rng.borrow_mut();
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (((*state >> 32) as u128) % modulus) as u8
    })
}

/// A fresh, unpredictable 64-bit connection ID. Used by a client choosing its
/// initial connection ID and by a server parent allocating a server-side ID
/// for a new child.
pub fn random_connection_id() -> u64 {
    rand::thread_rng().next_u64()
}

/// A greased version number: one with a `0x?a?a?a?a` pattern, matching the
/// reserved-version convention QUIC versions used during draft negotiation.
pub fn grease_version() -> u32 {
    let base = rand::thread_rng().next_u32();
    (base & 0xf0f0f0f0) | 0x0a0a0a0a
}
