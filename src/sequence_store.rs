//! Ordered collection of variable-length integer sequences over an
//! alphabet, with sliding-window and positional views.

use crate::error::{HmmKernelError, Result};

#[derive(Debug, Clone)]
enum View {
    /// Sequences stored as-is.
    Owned(Vec<Vec<u32>>),
    /// `num_vectors` virtual sequences of length `w - skip`, aliasing
    /// `buffer[i * step + skip .. i * step + skip + (w - skip)]`.
    Sliding {
        buffer: Vec<u32>,
        w: usize,
        step: usize,
        skip: usize,
        num_vectors: usize,
    },
    /// Virtual sequences at explicit anchor positions.
    Positions {
        buffer: Vec<u32>,
        w: usize,
        skip: usize,
        anchors: Vec<usize>,
    },
}

/// A sequence store: `N` variable-length sequences of small integers.
/// Cheap to clone only for [`StringStore::sliding_window`] /
/// [`StringStore::position_list`] which replace the view, not the data.
#[derive(Debug, Clone)]
pub struct StringStore {
    view: View,
    max_len: usize,
}

impl StringStore {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            view: View::Owned(sequences),
            max_len,
        }
    }

    /// Borrowed view of sequence `i`, stable across kernel/HMM reads.
    pub fn get(&self, i: usize) -> &[u32] {
        match &self.view {
            View::Owned(seqs) => &seqs[i],
            View::Sliding {
                buffer,
                w,
                step,
                skip,
                ..
            } => {
                let start = i * step + skip;
                &buffer[start..start + (w - skip)]
            }
            View::Positions {
                buffer,
                w,
                skip,
                anchors,
            } => {
                let start = anchors[i] + skip;
                &buffer[start..start + (w - skip)]
            }
        }
    }

    pub fn len(&self, i: usize) -> usize {
        self.get(i).len()
    }

    pub fn num(&self) -> usize {
        match &self.view {
            View::Owned(seqs) => seqs.len(),
            View::Sliding { num_vectors, .. } => *num_vectors,
            View::Positions { anchors, .. } => anchors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num() == 0
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Replaces the store with `N' = (L - w) / step + 1` virtual
    /// sequences of effective length `w - skip`, aliasing the original
    /// buffer. Requires a single underlying sequence (`L` is that
    /// sequence's length); fails with [`HmmKernelError::WindowTooLarge`]
    /// if `w > max_len`.
    pub fn sliding_window(&mut self, w: usize, step: usize, skip: usize) -> Result<()> {
        if w > self.max_len {
            return Err(HmmKernelError::WindowTooLarge {
                window: w,
                max_len: self.max_len,
            });
        }
        let buffer = self.flatten_single();
        let l = buffer.len();
        let num_vectors = (l - w) / step + 1;
        self.view = View::Sliding {
            buffer,
            w,
            step,
            skip,
            num_vectors,
        };
        self.max_len = w - skip;
        Ok(())
    }

    /// Same as [`StringStore::sliding_window`] but at explicit anchor
    /// positions; fails with [`HmmKernelError::WindowOutOfRange`] per
    /// offending anchor.
    pub fn position_list(&mut self, w: usize, positions: &[usize], skip: usize) -> Result<()> {
        let buffer = self.flatten_single();
        let l = buffer.len();
        for &p in positions {
            if p + w > l {
                return Err(HmmKernelError::WindowOutOfRange { position: p, len: l });
            }
        }
        self.view = View::Positions {
            buffer,
            w,
            skip,
            anchors: positions.to_vec(),
        };
        self.max_len = w - skip;
        Ok(())
    }

    fn flatten_single(&self) -> Vec<u32> {
        match &self.view {
            View::Owned(seqs) => {
                assert_eq!(seqs.len(), 1, "windowed views require a single sequence");
                seqs[0].clone()
            }
            View::Sliding { buffer, .. } | View::Positions { buffer, .. } => buffer.clone(),
        }
    }
}
