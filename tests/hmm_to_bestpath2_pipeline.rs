//! (B1) With a lookback of 1, zero PLiFs and zero segment sums,
//! `BestPath2::decode` over an HMM's own transition/emission parameters
//! must reduce to plain Viterbi: same decoded path, same log-score, as
//! `Hmm::best_path`.

use eyre::Result;
use libhmmkernel::bestpath2::{BestPath2, BestPath2Options, LookbackTable, PenaltyTable};
use libhmmkernel::{Hmm, StringStore};
use ndarray::Array2;
use pretty_assertions::assert_eq;

#[test]
fn bestpath2_with_trivial_penalties_matches_hmm_viterbi() -> Result<()> {
    let n = 3;
    let m = 2;
    let mut hmm = Hmm::random(n, m, 42);
    hmm.normalize(true);

    let obs = vec![0u32, 1, 0, 1, 1];
    let t_len = obs.len();
    hmm.set_observations(StringStore::new(vec![obs.clone()]), None);
    let expected_score = hmm.best_path(0)?;
    let expected_path = hmm.path(0).to_vec();

    let mut trans_a = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            trans_a[[i, j]] = hmm.get_a(i, j);
        }
    }
    let term_q: Vec<f64> = (0..n).map(|i| hmm.get_q(i)).collect();

    let mut seq = Array2::zeros((n, t_len));
    for j in 0..n {
        seq[[j, 0]] = hmm.get_p(j) + hmm.get_b(j, obs[0] as usize);
        for t in 1..t_len {
            seq[[j, t]] = hmm.get_b(j, obs[t] as usize);
        }
    }

    let pos: Vec<usize> = (0..t_len).collect();
    let pen = PenaltyTable::new(n);
    let segment_sum = Array2::from_elem((n, t_len), 0.0);
    let lookback = LookbackTable::uniform(n, 1);
    let decoder = BestPath2::new(n, lookback, BestPath2Options::default());
    let result = decoder.decode(&seq, &pos, &trans_a, &term_q, &pen, &[], &segment_sum)?;

    assert!((result.prob_nbest[0] - expected_score).abs() < 1e-9);
    assert_eq!(result.state_seq[0], expected_path);

    Ok(())
}
