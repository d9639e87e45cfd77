//! (H6) `append(A, B); normalize()` yields a valid HMM whose support is
//! the union of `A` and `B`'s supports: every state reachable in `A` or
//! `B` alone stays reachable in the concatenation, and the merged model's
//! rows still sum to one after normalization.

use eyre::Result;
use libhmmkernel::Hmm;
use ndarray::Array2;

fn left_to_right(n: usize, m: usize) -> Hmm {
    let mut p = vec![0.0; n];
    p[0] = 1.0;
    let mut q = vec![0.0; n];
    q[n - 1] = 1.0;
    let mut a = Array2::zeros((n, n));
    for i in 0..n - 1 {
        a[[i, i + 1]] = 1.0;
    }
    let b = Array2::from_elem((n, m), 1.0 / m as f64);
    Hmm::from_dense(p, q, a, b).unwrap()
}

#[test]
fn h6_append_then_normalize_is_valid_and_unions_support() -> Result<()> {
    let a = left_to_right(3, 4);
    let b = left_to_right(2, 4);

    let mut merged = left_to_right(3, 4);
    merged.append(&b)?;
    merged.normalize(true);

    assert_eq!(merged.n_states(), a.n_states() + b.n_states());

    for i in 0..merged.n_states() {
        let row_sum: f64 = (0..merged.n_states()).map(|j| merged.get_a(i, j).exp()).sum::<f64>()
            + merged.get_q(i).exp();
        assert!((row_sum - 1.0).abs() < 1e-9, "row {i} sums to {row_sum}");
        let b_sum: f64 = (0..merged.n_symbols()).map(|o| merged.get_b(i, o).exp()).sum();
        assert!((b_sum - 1.0).abs() < 1e-9, "emission row {i} sums to {b_sum}");
    }

    // A's internal left-to-right edges (0->1, 1->2) survive into the
    // merged model's first block.
    assert!(merged.get_a(0, 1).exp() > 0.0);
    assert!(merged.get_a(1, 2).exp() > 0.0);
    // B's internal edge (0->1 within its block, offset by A's N=3) survives.
    assert!(merged.get_a(3, 4).exp() > 0.0);
    // The bridge A.q[2] * B.p[0] wires the blocks together.
    assert!(merged.get_a(2, 3).exp() > 0.0);

    Ok(())
}
