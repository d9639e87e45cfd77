//! Spec scenario 3: 3-state, 4-symbol model, 100 random DNA sequences of
//! length 20, ten Baum-Welch iterations. Log-likelihood must be strictly
//! monotone non-decreasing and every row of the final model must sum to
//! one.

use eyre::Result;
use libhmmkernel::{Hmm, StringStore};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_dna_corpus(num: usize, len: usize, seed: u64) -> Vec<Vec<u32>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..num)
        .map(|_| (0..len).map(|_| rng.gen_range(0..4)).collect())
        .collect()
}

#[test]
fn scenario_3_baum_welch_on_dna() -> Result<()> {
    let obs = StringStore::new(random_dna_corpus(100, 20, 7));

    let mut current = Hmm::random(3, 4, 11);
    current.normalize(true);
    current.set_observations(obs.clone(), None);

    let mut log_likelihoods = Vec::new();
    for round in 0..10 {
        let mut next = Hmm::like(&current);
        next.set_observations(obs.clone(), None);
        let ll = next.estimate_baum_welch(&mut current)?;
        log_likelihoods.push(ll);
        current = next;
        eprintln!("round {round}: log-likelihood {ll}");
    }

    for pair in log_likelihoods.windows(2) {
        assert!(
            pair[1] >= pair[0] - 1e-6,
            "Baum-Welch decreased log-likelihood: {} -> {}",
            pair[0],
            pair[1]
        );
    }

    for i in 0..3 {
        let row_sum: f64 = (0..3).map(|j| current.get_a(i, j).exp()).sum::<f64>() + current.get_q(i).exp();
        assert!((row_sum - 1.0).abs() < 1e-9, "row {i} sums to {row_sum}");
        let b_sum: f64 = (0..4).map(|o| current.get_b(i, o).exp()).sum();
        assert!((b_sum - 1.0).abs() < 1e-9, "emission row {i} sums to {b_sum}");
    }
    let p_sum: f64 = (0..3).map(|i| current.get_p(i).exp()).sum();
    assert!((p_sum - 1.0).abs() < 1e-9, "p sums to {p_sum}");

    Ok(())
}
