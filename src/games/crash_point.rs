//! Crash point generation
//!
//! Terminal multipliers are drawn by inverse CDF: with probability `1 - rtp` the
//! round crashes instantly at 1.00, otherwise `m = 1 / (1 - u)` capped at the
//! configured maximum and floored to two decimals. For any cash-out target `m`,
//! `P(crash >= m) = rtp / m`, so every fixed strategy returns `rtp` on average.

use crate::errors::CrashResult;
use crate::games::types::{floor_multiplier, FairnessProof, RoundId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Payout curve parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashCurve {
    pub rtp: f64,
    pub max_multiplier: f64,
}

impl CrashCurve {
    pub fn new(rtp: f64, max_multiplier: f64) -> Self {
        Self {
            rtp,
            max_multiplier,
        }
    }

    /// Map two uniforms on `[0, 1)` to a terminal multiplier.
    ///
    /// `atom` decides the instant crash, `tail` places the multiplier on the
    /// Pareto tail. Monotone in `tail`, so a published seed fixes the result.
    pub fn multiplier_from_uniforms(&self, atom: f64, tail: f64) -> f64 {
        if atom >= self.rtp {
            return 1.0;
        }
        let tail = tail.clamp(0.0, 1.0 - f64::EPSILON);
        let raw = 1.0 / (1.0 - tail);
        floor_multiplier(raw.min(self.max_multiplier)).max(1.0)
    }
}

impl Default for CrashCurve {
    fn default() -> Self {
        Self::new(0.95, 1000.0)
    }
}

/// One round's terminal multiplier and optional fairness proof
#[derive(Debug, Clone, PartialEq)]
pub struct CrashDraw {
    pub multiplier: f64,
    pub proof: Option<FairnessProof>,
}

impl CrashDraw {
    pub fn unproven(multiplier: f64) -> Self {
        Self {
            multiplier,
            proof: None,
        }
    }
}

/// Source of terminal multipliers consumed by the round machine
pub trait CrashPointSource: Send {
    fn draw(&mut self, round_id: RoundId) -> CrashResult<CrashDraw>;
}

/// RNG-backed generator. Reseeds from the OS before every round unless built
/// with an explicit seed.
pub struct CrashPointGenerator {
    curve: CrashCurve,
    rng: StdRng,
    reseed_each_round: bool,
}

impl CrashPointGenerator {
    pub fn new(curve: CrashCurve) -> Self {
        Self {
            curve,
            rng: StdRng::from_entropy(),
            reseed_each_round: true,
        }
    }

    /// Deterministic stream for simulations
    pub fn with_seed(curve: CrashCurve, seed: u64) -> Self {
        Self {
            curve,
            rng: StdRng::seed_from_u64(seed),
            reseed_each_round: false,
        }
    }

    pub fn curve(&self) -> CrashCurve {
        self.curve
    }

    /// Replace the RNG stream with fresh OS entropy
    pub fn reseed(&mut self) {
        self.rng = StdRng::from_entropy();
    }

    /// Draw the next terminal multiplier
    pub fn draw(&mut self) -> f64 {
        if self.reseed_each_round {
            self.reseed();
        }
        let atom: f64 = self.rng.gen();
        let tail: f64 = self.rng.gen();
        self.curve.multiplier_from_uniforms(atom, tail)
    }
}

impl CrashPointSource for CrashPointGenerator {
    fn draw(&mut self, _round_id: RoundId) -> CrashResult<CrashDraw> {
        Ok(CrashDraw::unproven(CrashPointGenerator::draw(self)))
    }
}

/// Replays a fixed list of crash points, then repeats the last one
pub struct ScriptedCrashSource {
    points: VecDeque<f64>,
    last: f64,
}

impl ScriptedCrashSource {
    pub fn new(points: impl IntoIterator<Item = f64>) -> Self {
        Self {
            points: points.into_iter().collect(),
            last: 2.0,
        }
    }
}

impl CrashPointSource for ScriptedCrashSource {
    fn draw(&mut self, _round_id: RoundId) -> CrashResult<CrashDraw> {
        if let Some(next) = self.points.pop_front() {
            self.last = next;
        }
        Ok(CrashDraw::unproven(self.last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_produces_instant_crash() {
        let curve = CrashCurve::new(0.95, 1000.0);
        assert_eq!(curve.multiplier_from_uniforms(0.95, 0.9), 1.0);
        assert_eq!(curve.multiplier_from_uniforms(0.999, 0.5), 1.0);
    }

    #[test]
    fn test_tail_is_monotone_and_capped() {
        let curve = CrashCurve::new(0.95, 1000.0);
        assert_eq!(curve.multiplier_from_uniforms(0.0, 0.0), 1.0);
        assert_eq!(curve.multiplier_from_uniforms(0.0, 0.5), 2.0);
        assert_eq!(curve.multiplier_from_uniforms(0.0, 0.75), 4.0);
        assert_eq!(curve.multiplier_from_uniforms(0.0, 0.999_999), 1000.0);

        let mut previous = 1.0;
        for step in 0..1000 {
            let m = curve.multiplier_from_uniforms(0.1, step as f64 / 1000.0);
            assert!(m >= previous);
            previous = m;
        }
    }

    #[test]
    fn test_draws_have_two_decimals() {
        let mut generator = CrashPointGenerator::with_seed(CrashCurve::default(), 7);
        for _ in 0..1000 {
            let m = generator.draw();
            assert!(m >= 1.0 && m <= 1000.0);
            let cents = m * 100.0;
            assert!((cents - cents.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_seeded_streams_repeat() {
        let mut a = CrashPointGenerator::with_seed(CrashCurve::default(), 42);
        let mut b = CrashPointGenerator::with_seed(CrashCurve::default(), 42);
        for _ in 0..100 {
            assert_eq!(a.draw(), b.draw());
        }
    }

    #[test]
    fn test_survival_matches_rtp_over_m() {
        let curve = CrashCurve::new(0.95, 1000.0);
        let mut generator = CrashPointGenerator::with_seed(curve, 2024);
        let samples = 200_000;
        let above_two = (0..samples).filter(|_| generator.draw() >= 2.0).count();
        let observed = above_two as f64 / samples as f64;
        assert!((observed - 0.475).abs() < 0.01, "observed {}", observed);
    }

    #[test]
    fn test_scripted_source_repeats_last() {
        let mut source = ScriptedCrashSource::new([1.5, 3.0]);
        assert_eq!(source.draw(RoundId(1)).unwrap().multiplier, 1.5);
        assert_eq!(source.draw(RoundId(2)).unwrap().multiplier, 3.0);
        assert_eq!(source.draw(RoundId(3)).unwrap().multiplier, 3.0);
    }
}
