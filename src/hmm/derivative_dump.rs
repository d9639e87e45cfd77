//! Binary derivative dump (spec §6.3): a `f32` stream external MKL
//! solvers read model- and path-derivative vectors from. Strictly a
//! diagnostic/export format, nothing in this crate reads its own dumps
//! back into an `Hmm`.

use std::io::{self, Read, Write};

use crate::error::{HmmKernelError, Result};

/// Tags written as the second `f32` of a `(+inf, tag)` marker pair.
const TAG_MODEL: f32 = 1.0;
const TAG_DEFINED: f32 = 2.0;
const TAG_TRAILER: f32 = 3.0;

/// Which derivative family a stream's header declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Model,
    Defined,
}

impl DumpKind {
    fn tag(self) -> f32 {
        match self {
            DumpKind::Model => TAG_MODEL,
            DumpKind::Defined => TAG_DEFINED,
        }
    }

    fn from_tag(tag: f32) -> Result<Self> {
        if tag == TAG_MODEL {
            Ok(DumpKind::Model)
        } else if tag == TAG_DEFINED {
            Ok(DumpKind::Defined)
        } else {
            Err(HmmKernelError::IoMalformed {
                line: 0,
                msg: format!("unknown derivative dump header tag {tag}"),
            })
        }
    }
}

/// One payload block: `(prob, dp_0..dp_{N-1}, dq_0.., da.., db..)`, `da`
/// row-major `N x N`, `db` row-major `N x M`.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeBlock {
    pub prob: f32,
    pub dp: Vec<f32>,
    pub dq: Vec<f32>,
    pub da: Vec<f32>,
    pub db: Vec<f32>,
}

/// Writes `(+inf, 1.0)` or `(+inf, 2.0)` depending on `kind`.
pub fn write_header<W: Write>(w: &mut W, kind: DumpKind) -> io::Result<()> {
    write_f32_pair(w, f32::INFINITY, kind.tag())
}

/// Writes one payload block; caller is responsible for `dp`/`dq` having
/// `N` entries, `da` having `N*N`, and `db` having `N*M`, matching the
/// header's declared model shape.
pub fn write_block<W: Write>(w: &mut W, block: &DerivativeBlock) -> io::Result<()> {
    write_f32(w, block.prob)?;
    for &v in &block.dp {
        write_f32(w, v)?;
    }
    for &v in &block.dq {
        write_f32(w, v)?;
    }
    for &v in &block.da {
        write_f32(w, v)?;
    }
    for &v in &block.db {
        write_f32(w, v)?;
    }
    Ok(())
}

/// Writes `(+inf, 3.0)` followed by the four parameter counts `(N, N, N*N,
/// N*M)`, the trailer that lets a reader size each block without
/// re-deriving `N`/`M` from the header alone.
pub fn write_trailer<W: Write>(w: &mut W, n: usize, m: usize) -> io::Result<()> {
    write_f32_pair(w, f32::INFINITY, TAG_TRAILER)?;
    write_f32(w, n as f32)?;
    write_f32(w, n as f32)?;
    write_f32(w, (n * n) as f32)?;
    write_f32(w, (n * m) as f32)?;
    Ok(())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f32_pair<W: Write>(w: &mut W, a: f32, b: f32) -> io::Result<()> {
    write_f32(w, a)?;
    write_f32(w, b)
}

/// A fully parsed dump: the declared kind, every payload block, and the
/// trailer's parameter counts (`n_p, n_q, n_a, n_b`).
pub struct ParsedDump {
    pub kind: DumpKind,
    pub blocks: Vec<DerivativeBlock>,
    pub counts: (usize, usize, usize, usize),
}

/// Parses a full derivative dump given the `(N, M)` shape of the model it
/// came from (needed to size each block before the trailer is reached).
pub fn read_stream<R: Read>(r: &mut R, n: usize, m: usize) -> Result<ParsedDump> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)
        .map_err(|e| HmmKernelError::IoMalformed { line: 0, msg: e.to_string() })?;
    let mut floats = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        floats.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }
    if bytes.len() % 4 != 0 {
        return Err(HmmKernelError::IoMalformed {
            line: 0,
            msg: "derivative dump length is not a multiple of 4 bytes".into(),
        });
    }

    let mut pos = 0usize;
    let read_f32 = |floats: &[f32], pos: &mut usize| -> Result<f32> {
        let v = *floats.get(*pos).ok_or_else(|| HmmKernelError::IoMalformed {
            line: 0,
            msg: "derivative dump ended mid-record".into(),
        })?;
        *pos += 1;
        Ok(v)
    };

    let header_marker = read_f32(&floats, &mut pos)?;
    if header_marker != f32::INFINITY {
        return Err(HmmKernelError::IoMalformed {
            line: 0,
            msg: "derivative dump missing header marker".into(),
        });
    }
    let kind = DumpKind::from_tag(read_f32(&floats, &mut pos)?)?;

    let block_len = 1 + n + n + n * n + n * m;
    let mut blocks = Vec::new();
    loop {
        if pos >= floats.len() {
            return Err(HmmKernelError::IoMalformed {
                line: 0,
                msg: "derivative dump ended before trailer".into(),
            });
        }
        // Peek: a block never starts with +inf (probabilities are finite
        // log-space values), so +inf here means the trailer marker.
        if floats[pos] == f32::INFINITY {
            break;
        }
        if pos + block_len > floats.len() {
            return Err(HmmKernelError::IoMalformed {
                line: 0,
                msg: "derivative dump block truncated".into(),
            });
        }
        let prob = read_f32(&floats, &mut pos)?;
        let dp = floats[pos..pos + n].to_vec();
        pos += n;
        let dq = floats[pos..pos + n].to_vec();
        pos += n;
        let da = floats[pos..pos + n * n].to_vec();
        pos += n * n;
        let db = floats[pos..pos + n * m].to_vec();
        pos += n * m;
        blocks.push(DerivativeBlock { prob, dp, dq, da, db });
    }

    let trailer_marker = read_f32(&floats, &mut pos)?;
    if trailer_marker != f32::INFINITY {
        return Err(HmmKernelError::IoMalformed {
            line: 0,
            msg: "derivative dump missing trailer marker".into(),
        });
    }
    let trailer_tag = read_f32(&floats, &mut pos)?;
    if trailer_tag != TAG_TRAILER {
        return Err(HmmKernelError::IoMalformed {
            line: 0,
            msg: format!("expected trailer tag {TAG_TRAILER}, got {trailer_tag}"),
        });
    }
    let n_p = read_f32(&floats, &mut pos)? as usize;
    let n_q = read_f32(&floats, &mut pos)? as usize;
    let n_a = read_f32(&floats, &mut pos)? as usize;
    let n_b = read_f32(&floats, &mut pos)? as usize;

    Ok(ParsedDump { kind, blocks, counts: (n_p, n_q, n_a, n_b) })
}
