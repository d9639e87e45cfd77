//! Discrete-sequence HMM engine and weighted-degree string kernels.
//!
//! The crate is organized leaf-first:
//! [`alphabet`] and [`sequence_store`] hold the data model, [`logmath`]
//! backs every log-space reduction, [`hmm`] is the generative model,
//! [`trie`] backs the linadd optimization used by [`kernel`]'s WD/WDS
//! kernels, and [`bestpath2`] combines an HMM with PLiF-scored segments.

pub mod alphabet;
pub mod bestpath2;
pub mod error;
pub mod hmm;
pub mod kernel;
pub mod logmath;
pub mod sequence_store;
pub mod trie;

pub use alphabet::{revcomp_dna, Alphabet};
pub use bestpath2::{BestPath2, BestPath2Options, BestPath2Result};
pub use error::{HmmKernelError, Result};
pub use hmm::{DerivativeBlock, DumpKind, Hmm, HmmOptions};
pub use kernel::{Plif, WdKernel, WdKernelOptions, WdsKernel, WdsKernelOptions};
pub use sequence_store::StringStore;
pub use trie::Trie;
