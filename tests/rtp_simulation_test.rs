//! Long-run return of fixed cash-out strategies

use crashline::games::{CrashCurve, CrashPointGenerator, CrashPointSource, RoundId, VrfCrashSource};

fn strategy_return(points: &[f64], target: f64) -> f64 {
    let paid: f64 = points
        .iter()
        .map(|&crash| if crash >= target { target } else { 0.0 })
        .sum();
    paid / points.len() as f64
}

#[test]
fn test_seeded_generator_matches_rtp() {
    let curve = CrashCurve::new(0.95, 1000.0);
    let mut generator = CrashPointGenerator::with_seed(curve, 7);
    let points: Vec<f64> = (0..100_000).map(|_| generator.draw()).collect();

    assert!((strategy_return(&points, 2.0) - 0.95).abs() < 0.02);
    assert!((strategy_return(&points, 1.5) - 0.95).abs() < 0.02);
    assert!((strategy_return(&points, 10.0) - 0.95).abs() < 0.05);

    // House atom plus tail draws that floor to 1.00
    let expected_instant = 0.05 + 0.95 * (1.0 - 1.0 / 1.01);
    let instant = points.iter().filter(|&&p| p == 1.0).count() as f64 / points.len() as f64;
    assert!((instant - expected_instant).abs() < 0.005);
    assert!(points.iter().all(|&p| (1.0..=1000.0).contains(&p)));
}

#[test]
fn test_lower_rtp_lowers_every_strategy() {
    let curve = CrashCurve::new(0.80, 1000.0);
    let mut generator = CrashPointGenerator::with_seed(curve, 99);
    let points: Vec<f64> = (0..100_000).map(|_| generator.draw()).collect();
    assert!((strategy_return(&points, 2.0) - 0.80).abs() < 0.02);
}

#[test]
fn test_vrf_source_matches_rtp() {
    let curve = CrashCurve::new(0.95, 1000.0);
    let mut source = VrfCrashSource::new_random(curve);
    let points: Vec<f64> = (1..=20_000)
        .map(|id| source.draw(RoundId(id)).unwrap().multiplier)
        .collect();
    assert!((strategy_return(&points, 2.0) - 0.95).abs() < 0.05);
}
