//! Property-based cross-checks for (K1) WD kernel symmetry and (T1) the
//! trie's add/negate-add invariant, run over arbitrary inputs via
//! `quickcheck` rather than the fixed examples the unit tests already
//! cover.

use float_eq::assert_float_eq;
use libhmmkernel::{Trie, WdKernel, WdKernelOptions};
use quickcheck::{QuickCheck, TestResult};

const ALPHABET_SIZE: u32 = 4;

fn to_symbols(bytes: &[u8]) -> Vec<u32> {
    bytes.iter().map(|&b| (b as u32) % ALPHABET_SIZE).collect()
}

/// (K1) `K(x,y) = K(y,x)` for any pair of equal-length sequences, for
/// every WD compute path (plain, block, mismatch).
#[test]
fn k1_wd_kernel_is_symmetric_for_arbitrary_sequences() {
    fn prop(xs: Vec<u8>, ys: Vec<u8>, degree: u8) -> TestResult {
        let degree = (degree % 4 + 1) as usize;
        let len = xs.len().min(ys.len());
        if len < degree {
            return TestResult::discard();
        }
        let x = to_symbols(&xs[..len]);
        let y = to_symbols(&ys[..len]);

        let kernel = WdKernel::new(degree, ALPHABET_SIZE as usize, WdKernelOptions::default()).unwrap();
        let xy = kernel.compute(&x, &y).unwrap();
        let yx = kernel.compute(&y, &x).unwrap();
        assert_float_eq!(xy, yx, abs <= 1e-9);
        TestResult::passed()
    }
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop as fn(Vec<u8>, Vec<u8>, u8) -> TestResult);
}

/// (K1) Block-mode evaluation must agree with the plain inner-loop path
/// on the same arbitrary symmetric inputs.
#[test]
fn block_mode_matches_plain_mode_for_arbitrary_sequences() {
    fn prop(xs: Vec<u8>, ys: Vec<u8>, degree: u8) -> TestResult {
        let degree = (degree % 4 + 1) as usize;
        let len = xs.len().min(ys.len());
        if len == 0 {
            return TestResult::discard();
        }
        let x = to_symbols(&xs[..len]);
        let y = to_symbols(&ys[..len]);

        let plain = WdKernel::new(degree, ALPHABET_SIZE as usize, WdKernelOptions::default()).unwrap();
        let block = WdKernel::new(
            degree,
            ALPHABET_SIZE as usize,
            WdKernelOptions { block_computation: true, ..Default::default() },
        )
        .unwrap();
        let a = plain.compute_without_mismatch(&x, &y);
        let b = block.compute_using_block(&x, &y).unwrap();
        assert_float_eq!(a, b, abs <= 1e-9);
        TestResult::passed()
    }
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop as fn(Vec<u8>, Vec<u8>, u8) -> TestResult);
}

/// (T1) `add(seq, alpha); add(seq, -alpha)` leaves the trie numerically
/// equivalent to an empty one, for arbitrary degree-length windows and
/// arbitrary `alpha`.
#[test]
fn t1_trie_add_then_negate_is_empty_for_arbitrary_windows() {
    fn prop(symbols: Vec<u8>, alpha: f64) -> TestResult {
        if !alpha.is_finite() || alpha.abs() > 1e6 {
            return TestResult::discard();
        }
        let degree = 3usize;
        if symbols.len() < degree {
            return TestResult::discard();
        }
        let window = to_symbols(&symbols[..degree]);
        let weights = vec![1.0, 0.5, 0.25];

        let mut trie = Trie::new(degree, ALPHABET_SIZE as usize, false, true);
        trie.add(0, &window, alpha, &weights).unwrap();
        trie.add(0, &window, -alpha, &weights).unwrap();
        let residual = trie.query(0, &window, &weights);
        assert_float_eq!(residual, 0.0, abs <= 1e-6);
        TestResult::passed()
    }
    QuickCheck::new().tests(200).quickcheck(prop as fn(Vec<u8>, f64) -> TestResult);
}

/// Same invariant, but with `use_compact_terminal_nodes` off (the
/// memory-hungry leaf representation spec §3's Trie section describes).
#[test]
fn t1_holds_in_non_compact_mode_too() {
    fn prop(symbols: Vec<u8>, alpha: f64) -> TestResult {
        if !alpha.is_finite() || alpha.abs() > 1e6 {
            return TestResult::discard();
        }
        let degree = 2usize;
        if symbols.len() < degree {
            return TestResult::discard();
        }
        let window = to_symbols(&symbols[..degree]);
        let weights = vec![1.0, 2.0];

        let mut trie = Trie::new(degree, ALPHABET_SIZE as usize, false, false);
        trie.add(0, &window, alpha, &weights).unwrap();
        trie.add(0, &window, -alpha, &weights).unwrap();
        let residual = trie.query(0, &window, &weights);
        assert_float_eq!(residual, 0.0, abs <= 1e-6);
        TestResult::passed()
    }
    QuickCheck::new().tests(200).quickcheck(prop as fn(Vec<u8>, f64) -> TestResult);
}
