//! Depth-bounded trie used by the WD/WDS kernels' linadd optimization.
//! Nodes live in a flat `Vec` addressed by `u32` handles, a bump arena:
//! nodes are appended and never individually freed, only the whole trie
//! is cleared between linadd rounds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{HmmKernelError, Result};
use crate::sequence_store::StringStore;

const NONE: u32 = u32::MAX;
const CANCEL_POLL_INTERVAL: usize = 1024;

#[derive(Debug, Clone)]
struct TrieNode {
    weight: f64,
    children: Vec<u32>,
    /// Present once this node has been converted to a compact terminal:
    /// `child_weights[symbol]` replaces a full extra level of children.
    compact: Option<Vec<f64>>,
}

impl TrieNode {
    fn new(alphabet_size: usize) -> Self {
        Self {
            weight: 0.0,
            children: vec![NONE; alphabet_size],
            compact: None,
        }
    }
}

/// A single-writer-many-reader additive trie over `degree`-length
/// windows of an `alphabet_size`-ary alphabet.
pub struct Trie {
    nodes: Vec<TrieNode>,
    degree: usize,
    alphabet_size: usize,
    use_compact_terminal_nodes: bool,
    positional: bool,
    cancel: Arc<AtomicBool>,
}

impl Trie {
    pub fn new(degree: usize, alphabet_size: usize, positional: bool, use_compact_terminal_nodes: bool) -> Self {
        Self {
            nodes: vec![TrieNode::new(alphabet_size)],
            degree,
            alphabet_size,
            use_compact_terminal_nodes,
            positional,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// A clonable handle the caller can flip from another thread to
    /// abort a long-running `add`/`query`/`batch_query` sweep.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Read-only poll of the cancel flag, for callers driving a long
    /// loop of many `add`/`query` calls (Cancellation: long
    /// add/query loops read a shared cancel flag every few iterations).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Drops every node but the root, ready for the next linadd round.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[0] = TrieNode::new(self.alphabet_size);
    }

    fn weight_index(&self, depth: usize, position: usize) -> usize {
        if self.positional {
            position * self.degree + depth
        } else {
            depth
        }
    }

    /// Inserts one support vector's `degree`-length window, scaling by
    /// `alpha`.
    pub fn add(&mut self, position: usize, symbols: &[u32], alpha: f64, weights: &[f64]) -> Result<()> {
        if symbols.len() != self.degree {
            return Err(HmmKernelError::DimensionMismatch(format!(
                "trie add expects {} symbols, got {}",
                self.degree,
                symbols.len()
            )));
        }
        let mut cur = 0u32;
        for d in 0..self.degree.saturating_sub(1) {
            let sym = symbols[d] as usize;
            if self.nodes[cur as usize].children[sym] == NONE {
                let new_id = self.nodes.len() as u32;
                self.nodes.push(TrieNode::new(self.alphabet_size));
                self.nodes[cur as usize].children[sym] = new_id;
            }
            cur = self.nodes[cur as usize].children[sym];

            let widx = self.weight_index(d, position);
            let w = weights.get(widx).copied().unwrap_or(0.0);
            self.nodes[cur as usize].weight += alpha * w;
        }

        let last_widx = self.weight_index(self.degree.saturating_sub(1), position);
        let last_w = weights.get(last_widx).copied().unwrap_or(0.0);
        let last_sym = symbols[self.degree - 1] as usize;

        if self.use_compact_terminal_nodes {
            if self.nodes[cur as usize].compact.is_none() {
                self.nodes[cur as usize].compact = Some(vec![0.0; self.alphabet_size]);
            }
            self.nodes[cur as usize].compact.as_mut().unwrap()[last_sym] += alpha * last_w;
        } else {
            if self.nodes[cur as usize].children[last_sym] == NONE {
                let new_id = self.nodes.len() as u32;
                self.nodes.push(TrieNode::new(self.alphabet_size));
                self.nodes[cur as usize].children[last_sym] = new_id;
            }
            let leaf = self.nodes[cur as usize].children[last_sym];
            self.nodes[leaf as usize].weight += alpha * last_w;
        }
        Ok(())
    }

    /// The dual of [`Trie::add`]: sums every node weight along the path
    /// taken by `symbols`, stopping early at the first missing child.
    pub fn query(&self, position: usize, symbols: &[u32], weights: &[f64]) -> f64 {
        let mut cur = 0u32;
        let mut sum = 0.0;
        for d in 0..self.degree.saturating_sub(1) {
            let sym = symbols[d] as usize;
            let next = self.nodes[cur as usize].children[sym];
            if next == NONE {
                return sum;
            }
            cur = next;
            sum += self.nodes[cur as usize].weight;
        }
        let last_widx = self.weight_index(self.degree - 1, position);
        let _ = weights.get(last_widx);
        let last_sym = symbols[self.degree - 1] as usize;
        if self.use_compact_terminal_nodes {
            if let Some(cw) = &self.nodes[cur as usize].compact {
                sum += cw[last_sym];
            }
        } else {
            let leaf = self.nodes[cur as usize].children[last_sym];
            if leaf != NONE {
                sum += self.nodes[leaf as usize].weight;
            }
        }
        sum
    }

    /// Evaluates `store` at every one of `indices` against this trie,
    /// in parallel ("parallelizable over
    /// positions", here specialized to parallelizing over query
    /// vectors, which this trie's callers hold one-per-position).
    pub fn batch_query(&self, position: usize, store: &StringStore, indices: &[usize], weights: &[f64]) -> Vec<f64> {
        indices
            .par_iter()
            .map(|&i| self.query(position, store.get(i), weights))
            .collect()
    }

    /// Recursive mismatch-tolerant insert: at each position the walk
    /// either follows the exact symbol (no mismatch charged) or branches
    /// into every other symbol (charging one mismatch), until
    /// `max_mismatch` is exhausted.
    pub fn add_with_mismatch(&mut self, position: usize, alpha: f64, symbols: &[u32], weights: &[f64], max_mismatch: usize) -> Result<()> {
        if max_mismatch == 0 {
            return self.add(position, symbols, alpha, weights);
        }
        self.add_with_mismatch_rec(0u32, 0, position, alpha, symbols, weights, 0, max_mismatch)
    }

    /// `cur` has `depth` symbols already consumed on entry.
    #[allow(clippy::too_many_arguments)]
    fn add_with_mismatch_rec(
        &mut self,
        cur: u32,
        depth: usize,
        position: usize,
        alpha: f64,
        symbols: &[u32],
        weights: &[f64],
        mismatches_used: usize,
        max_mismatch: usize,
    ) -> Result<()> {
        if depth == self.degree.saturating_sub(1) {
            let last_widx = mismatches_used * self.degree + self.weight_index(self.degree - 1, position);
            let last_w = weights.get(last_widx).copied().unwrap_or(0.0);
            let exact_sym = symbols[self.degree - 1] as usize;
            self.insert_leaf(cur, exact_sym, alpha * last_w);
            if mismatches_used < max_mismatch {
                for sym in 0..self.alphabet_size {
                    if sym == exact_sym {
                        continue;
                    }
                    let widx = (mismatches_used + 1) * self.degree + self.weight_index(self.degree - 1, position);
                    let w = weights.get(widx).copied().unwrap_or(0.0);
                    self.insert_leaf(cur, sym, alpha * w);
                }
            }
            return Ok(());
        }

        let exact_sym = symbols[depth] as usize;
        let exact_child = self.child_or_create(cur, exact_sym);
        let widx = mismatches_used * self.degree + self.weight_index(depth, position);
        let w = weights.get(widx).copied().unwrap_or(0.0);
        self.nodes[exact_child as usize].weight += alpha * w;
        self.add_with_mismatch_rec(exact_child, depth + 1, position, alpha, symbols, weights, mismatches_used, max_mismatch)?;

        if mismatches_used < max_mismatch {
            for sym in 0..self.alphabet_size {
                if sym == exact_sym {
                    continue;
                }
                let branch = self.child_or_create(cur, sym);
                let widx = (mismatches_used + 1) * self.degree + self.weight_index(depth, position);
                let w = weights.get(widx).copied().unwrap_or(0.0);
                self.nodes[branch as usize].weight += alpha * w;
                self.add_with_mismatch_rec(
                    branch,
                    depth + 1,
                    position,
                    alpha,
                    symbols,
                    weights,
                    mismatches_used + 1,
                    max_mismatch,
                )?;
            }
        }
        Ok(())
    }

    fn child_or_create(&mut self, cur: u32, sym: usize) -> u32 {
        if self.nodes[cur as usize].children[sym] == NONE {
            let new_id = self.nodes.len() as u32;
            self.nodes.push(TrieNode::new(self.alphabet_size));
            self.nodes[cur as usize].children[sym] = new_id;
        }
        self.nodes[cur as usize].children[sym]
    }

    fn insert_leaf(&mut self, cur: u32, sym: usize, delta: f64) {
        if self.use_compact_terminal_nodes {
            if self.nodes[cur as usize].compact.is_none() {
                self.nodes[cur as usize].compact = Some(vec![0.0; self.alphabet_size]);
            }
            self.nodes[cur as usize].compact.as_mut().unwrap()[sym] += delta;
        } else {
            let leaf = self.child_or_create(cur, sym);
            self.nodes[leaf as usize].weight += delta;
        }
    }

    /// Accumulates every node's weight into `level_contribs[depth /
    /// stepsize]`; `level_contribs`
    /// must have `ceil(degree / stepsize)` slots.
    pub fn compute_by_subkernel(&self, level_contribs: &mut [f64], stepsize: usize) {
        let mut stack = vec![(0u32, 0usize)];
        let mut iterations = 0usize;
        while let Some((id, depth)) = stack.pop() {
            iterations += 1;
            if iterations % CANCEL_POLL_INTERVAL == 0 && self.cancel.load(Ordering::Relaxed) {
                return;
            }
            let node = &self.nodes[id as usize];
            let bucket = (depth / stepsize).min(level_contribs.len().saturating_sub(1));
            level_contribs[bucket] += node.weight;
            if let Some(cw) = &node.compact {
                let leaf_bucket = ((self.degree - 1) / stepsize).min(level_contribs.len().saturating_sub(1));
                level_contribs[leaf_bucket] += cw.iter().sum::<f64>();
            }
            for &child in &node.children {
                if child != NONE {
                    stack.push((child, depth + 1));
                }
            }
        }
    }

    /// Credits every accumulated leaf's weight into a `4^k`-wide k-mer
    /// table, keyed by the exact symbol sequence from the root to that
    /// leaf. Assumes every leaf in this trie sits at depth `max_degree`;
    /// [`WdKernel::compute_scoring`] guarantees this by building one
    /// trie per position at that exact depth.
    pub fn scoring_traversal(&self, max_degree: usize) -> Vec<f64> {
        let table_size = self.alphabet_size.pow(max_degree as u32).max(1);
        let mut scores = vec![0.0; table_size];
        self.scoring_rec(0, 0, &mut scores);
        scores
    }

    fn scoring_rec(&self, id: u32, prefix_code: usize, scores: &mut [f64]) {
        let node = &self.nodes[id as usize];
        for (sym, &child) in node.children.iter().enumerate() {
            if child == NONE {
                continue;
            }
            let next_code = prefix_code * self.alphabet_size + sym;
            self.scoring_rec(child, next_code, scores);
        }
        if let Some(cw) = &node.compact {
            for (sym, &w) in cw.iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                let next_code = prefix_code * self.alphabet_size + sym;
                let idx = next_code % scores.len().max(1);
                scores[idx] += w;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn t1_add_then_negate_add_is_empty() {
        let mut trie = Trie::new(3, 4, false, true);
        let weights = vec![1.0, 0.5, 0.25];
        trie.add(0, &[0, 1, 2], 1.0, &weights).unwrap();
        trie.add(0, &[0, 1, 2], -1.0, &weights).unwrap();
        assert_eq!(trie.query(0, &[0, 1, 2], &weights), 0.0);
    }

    #[test]
    fn query_matches_add_for_full_match() {
        let mut trie = Trie::new(3, 4, false, true);
        let weights = vec![1.0, 0.5, 0.25];
        trie.add(0, &[0, 1, 2], 2.0, &weights).unwrap();
        let score = trie.query(0, &[0, 1, 2], &weights);
        let expected = 2.0 * (1.0 + 0.5 + 0.25);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn query_stops_contribution_at_first_mismatch() {
        let mut trie = Trie::new(3, 4, false, true);
        let weights = vec![1.0, 0.5, 0.25];
        trie.add(0, &[0, 1, 2], 2.0, &weights).unwrap();
        let score = trie.query(0, &[0, 3, 2], &weights);
        assert!((score - 2.0 * 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_compact_mode_matches_compact_mode() {
        let mut compact = Trie::new(2, 4, false, true);
        let mut expanded = Trie::new(2, 4, false, false);
        let weights = vec![1.0, 2.0];
        compact.add(0, &[1, 2], 1.5, &weights).unwrap();
        expanded.add(0, &[1, 2], 1.5, &weights).unwrap();
        assert!((compact.query(0, &[1, 2], &weights) - expanded.query(0, &[1, 2], &weights)).abs() < 1e-9);
    }
}
