//! Weighted-degree string kernels over fixed-length byte sequences,
//! plus their shared PLiF building block.

mod plif;
mod wd;
mod wds;

pub use plif::Plif;
pub use wd::{WdKernel, WdKernelOptions};
pub use wds::{WdsKernel, WdsKernelOptions};
