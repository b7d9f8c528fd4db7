//! Human-readable session identifiers: `<adjective>-<noun>-<number>`.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

const ADJECTIVES: [&str; 16] = [
    "cosmic", "mystic", "stellar", "quantum", "cyber", "neon", "turbo", "ultra", "alpha", "omega",
    "shadow", "ghost", "plasma", "lunar", "solar", "astral",
];

const NOUNS: [&str; 16] = [
    "phoenix", "dragon", "tiger", "eagle", "shark", "wolf", "bear", "fox", "turtle", "falcon",
    "raven", "nebula", "comet", "meteor", "galaxy", "nova",
];

/// Exclusive upper bound of the numeric suffix.
const SUFFIX_RANGE: u32 = 10_000;

/// Session id source. Owns its RNG; pass one in wherever a session is created.
pub struct IdGenerator {
    rng: Box<dyn RngCore + Send>,
}

impl IdGenerator {
    /// Generator seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic generator (tests, reproducible runs).
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self { rng: Box::new(rng) }
    }

    pub fn next_id(&mut self) -> String {
        let adj = ADJECTIVES[self.rng.gen_range(0..ADJECTIVES.len())];
        let noun = NOUNS[self.rng.gen_range(0..NOUNS.len())];
        let num = self.rng.gen_range(0..SUFFIX_RANGE);
        format!("{adj}-{noun}-{num}")
    }
}
