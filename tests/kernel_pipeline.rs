//! Cross-component pipeline: a `StringStore` sliding-window view feeds
//! fixed-length windows into the WD kernel, and the kernel's trie-backed
//! linadd path must agree with direct summation over those windows (spec
//! dataflow: "The StringStore feeds ... the kernels as the left-hand /
//! right-hand sides").

use eyre::Result;
use libhmmkernel::{StringStore, WdKernel, WdKernelOptions};

#[test]
fn sliding_window_feeds_wd_kernel_linadd_consistently() -> Result<()> {
    // Window length equals the kernel's degree, so every window is a
    // single full-length anchor with no short tail window, which the
    // trie-backed linadd path (only walks full-degree anchors) needs to
    // agree with the direct per-pair sum.
    let mut store = StringStore::new(vec![vec![0u32, 1, 2, 3, 0, 1, 2, 3, 0, 1]]);
    store.sliding_window(3, 1, 0)?;
    assert_eq!(store.num(), 8);

    let mut kernel = WdKernel::new(
        3,
        4,
        WdKernelOptions {
            use_normalization: false,
            ..Default::default()
        },
    )?;

    let support_idx = vec![0usize, 2, 4];
    let alpha = vec![0.6, -0.2, 0.9];
    kernel.init_optimization(&store, &support_idx, &alpha)?;

    for query_idx in 0..store.num() {
        let y = store.get(query_idx);
        let direct: f64 = support_idx
            .iter()
            .zip(&alpha)
            .map(|(&k, &a)| a * kernel.compute(store.get(k), y).unwrap())
            .sum();
        let via_trie = kernel.compute_optimized(y)?;
        assert!(
            (direct - via_trie).abs() < 1e-6,
            "window {query_idx}: direct={direct} trie={via_trie}"
        );
    }

    Ok(())
}

#[test]
fn sliding_window_rejects_windows_larger_than_max_len() {
    let mut store = StringStore::new(vec![vec![0u32, 1, 2]]);
    let err = store.sliding_window(10, 1, 0).unwrap_err();
    assert!(matches!(
        err,
        libhmmkernel::HmmKernelError::WindowTooLarge { window: 10, max_len: 3 }
    ));
}
