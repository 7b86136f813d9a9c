//-
// Copyright 2017, 2018 The proptest developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single seedable RNG wrapper used by every subsystem in nexus that
//! needs determinism: Machine sampling (section 4.4), the Fuzz Driver's
//! per-iteration seeds (section 4.8), and the shared RNG used by
//! `MctDriver`'s equivalence mode to keep two machines' sampling in lock
//! step (section 4.5 step 3). Generalizes proptest's `TestRng`, which the
//! teacher scopes to strategy value generation only.

use rand::{Error, Rng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

/// Nexus's random number generator. A thin wrapper around `XorShiftRng` so
/// that every caller goes through the same seed-derivation rules rather than
/// touching `rand_xorshift` directly.
#[derive(Clone, Debug)]
pub struct TestRng {
    rng: XorShiftRng,
}

impl RngCore for TestRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.rng.try_fill_bytes(dest)
    }
}

pub type Seed = [u8; 16];

/// A fresh `u64` seed drawn from OS entropy, for callers (the MCT Driver,
/// the Fuzz Driver) that need a test seed but have no stored one and no
/// `Test::seed()` to fall back on.
pub fn new_rng_seed() -> u64 {
    TestRng::from_entropy().rng.next_u64()
}

impl TestRng {
    /// Construct a `TestRng` from a 64-bit seed, as used by `Test::seed` and
    /// the `--repr <seed>` CLI path. The seed is expanded to the full
    /// 128-bit xorshift seed by repetition, which keeps a given `u64` test
    /// seed reproducible across runs (the two's place in the expansion
    /// avoids an all-zero low half for small seeds).
    pub fn from_seed_u64(seed: u64) -> Self {
        let bytes = seed.to_le_bytes();
        let mut full = [0u8; 16];
        full[..8].copy_from_slice(&bytes);
        full[8..].copy_from_slice(&bytes);
        full[8] ^= 0xff;
        Self::from_seed(full)
    }

    /// Construct a default `TestRng` seeded from OS entropy, used only to
    /// compute the Runner's `run_seed` (spec.md 4.9 step 4) — every
    /// downstream RNG is then deterministically derived from a `u64` seed.
    pub fn from_entropy() -> Self {
        Self {
            rng: XorShiftRng::from_entropy(),
        }
    }

    /// Construct a child `TestRng` by perturbing a seed drawn from this one.
    /// Used by the Machine to hand out independent-but-deterministic RNGs
    /// (e.g. equivalence mode's per-machine bookkeeping) without ever
    /// reusing the same stream twice.
    pub fn gen_rng(&mut self) -> Self {
        Self::from_seed(self.new_rng_seed())
    }

    /// Generate a new randomized seed derived from this RNG's current
    /// state.
    pub fn new_rng_seed(&mut self) -> Seed {
        let mut seed = self.rng.gen::<Seed>();
        // Perturb so that constructing a child RNG from this seed never
        // reproduces the exact stream of `self`.
        for word in seed.chunks_mut(4) {
            word[3] ^= 0xde;
            word[2] ^= 0xad;
            word[1] ^= 0xbe;
            word[0] ^= 0xef;
        }
        seed
    }

    fn from_seed(seed: Seed) -> Self {
        Self {
            rng: XorShiftRng::from_seed(seed),
        }
    }
}
