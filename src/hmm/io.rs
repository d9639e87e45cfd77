//! Text model files and training-constraint files.

use ndarray::Array2;

use crate::error::{HmmKernelError, Result};
use crate::logmath::ALMOST_NEG_INF;

use super::{Constraints, Hmm};

/// A parsed/serialized `N=`, `M=`, `p=`, `q=`, `a=`, `b=` model file.
/// Parsing is stateful: `N` and `M` must appear before `p`/`q`/`a`/`b`,
/// which may then appear in any order, each at most once.
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub n: usize,
    pub m: usize,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    pub a: Array2<f64>,
    pub b: Array2<f64>,
}

impl ModelFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut n: Option<usize> = None;
        let mut m: Option<usize> = None;
        let mut p = None;
        let mut q = None;
        let mut a = None;
        let mut b = None;

        for (line_no, raw_line) in text.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let (key, rest) = split_assignment(line, line_no + 1)?;
            match key {
                "N" => n = Some(parse_int(rest, line_no + 1)? as usize),
                "M" => m = Some(parse_int(rest, line_no + 1)? as usize),
                "p" => p = Some(parse_vector(rest, line_no + 1)?),
                "q" => q = Some(parse_vector(rest, line_no + 1)?),
                "a" => a = Some(parse_matrix(rest, line_no + 1)?),
                "b" => b = Some(parse_matrix(rest, line_no + 1)?),
                other => {
                    return Err(HmmKernelError::IoMalformed {
                        line: line_no + 1,
                        msg: format!("unknown key `{other}`"),
                    })
                }
            }
        }

        let n = n.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing N=".into() })?;
        let m = m.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing M=".into() })?;
        let p = p.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing p=".into() })?;
        let q = q.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing q=".into() })?;
        let a_rows = a.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing a=".into() })?;
        let b_rows = b.ok_or_else(|| HmmKernelError::IoMalformed { line: 0, msg: "missing b=".into() })?;

        if p.len() != n || q.len() != n || a_rows.len() != n || b_rows.len() != n {
            return Err(HmmKernelError::DimensionMismatch(
                "model file rows/columns disagree with N/M".into(),
            ));
        }
        let a = rows_to_array(a_rows, n)?;
        let b = rows_to_array(b_rows, m)?;

        Ok(Self { n, m, p, q, a, b })
    }

    pub fn to_hmm(&self) -> Result<Hmm> {
        Hmm::from_dense(self.p.clone(), self.q.clone(), self.a.clone(), self.b.clone())
    }

    /// Serializes `hmm`, substituting `ALMOST_NEG_INF` for any
    /// non-finite probability.
    pub fn write(hmm: &Hmm) -> String {
        let mut out = String::new();
        out.push_str(&format!("N={};\n", hmm.n));
        out.push_str(&format!("M={};\n", hmm.m));
        out.push_str(&format!("p=[{}];\n", join_finite(&hmm.p)));
        out.push_str(&format!("q=[{}];\n", join_finite(&hmm.q)));
        out.push_str(&format!("a={};\n", matrix_to_string(&hmm.a)));
        out.push_str(&format!("b={};\n", matrix_to_string(&hmm.b)));
        out
    }
}

/// A parsed/serialized training-constraint file: `learn_*`
/// lists terminated by `-1`, `const_*` lists of `(index.., value)`
/// terminated by an all-`-1` tuple.
#[derive(Debug, Clone)]
pub struct ConstraintFile;

impl ConstraintFile {
    pub fn parse(text: &str) -> Result<Constraints> {
        let mut c = Constraints::default();
        for (line_no, raw_line) in text.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let (key, rest) = split_assignment(line, line_no + 1)?;
            match key {
                "learn_p" => c.learn_p = parse_index_list(rest, line_no + 1)?,
                "learn_q" => c.learn_q = parse_index_list(rest, line_no + 1)?,
                "learn_a" => c.learn_a = parse_pair_list(rest, line_no + 1)?,
                "learn_b" => c.learn_b = parse_pair_list(rest, line_no + 1)?,
                "const_p" => c.const_p = parse_index_value_list(rest, line_no + 1)?,
                "const_q" => c.const_q = parse_index_value_list(rest, line_no + 1)?,
                "const_a" => c.const_a = parse_triple_value_list(rest, line_no + 1)?,
                "const_b" => c.const_b = parse_triple_value_list(rest, line_no + 1)?,
                other => {
                    return Err(HmmKernelError::IoMalformed {
                        line: line_no + 1,
                        msg: format!("unknown key `{other}`"),
                    })
                }
            }
        }
        c.sort();
        Ok(c)
    }

    pub fn write(c: &Constraints) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "learn_p=[{},-1];\n",
            c.learn_p.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
        ));
        out.push_str(&format!(
            "learn_q=[{},-1];\n",
            c.learn_q.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
        ));
        out.push_str("learn_a=[");
        for &(i, j) in &c.learn_a {
            out.push_str(&format!("[{i},{j}];"));
        }
        out.push_str("[-1,-1]];\n");
        out.push_str("learn_b=[");
        for &(i, j) in &c.learn_b {
            out.push_str(&format!("[{i},{j}];"));
        }
        out.push_str("[-1,-1]];\n");
        out
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('%') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn split_assignment(line: &str, line_no: usize) -> Result<(&str, &str)> {
    let line = line.trim_end_matches(';').trim();
    let (key, rest) = line.split_once('=').ok_or_else(|| HmmKernelError::IoMalformed {
        line: line_no,
        msg: format!("expected `key=value`, got `{line}`"),
    })?;
    Ok((key.trim(), rest.trim()))
}

fn parse_int(s: &str, line_no: usize) -> Result<i64> {
    s.parse().map_err(|_| HmmKernelError::IoMalformed {
        line: line_no,
        msg: format!("expected integer, got `{s}`"),
    })
}

fn parse_float(s: &str, line_no: usize) -> Result<f64> {
    let s = s.trim();
    if s == "ALMOST_NEG_INF" {
        return Ok(ALMOST_NEG_INF);
    }
    s.parse().map_err(|_| HmmKernelError::IoMalformed {
        line: line_no,
        msg: format!("expected float, got `{s}`"),
    })
}

fn parse_vector(s: &str, line_no: usize) -> Result<Vec<f64>> {
    let inner = s.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| parse_float(t, line_no))
        .collect()
}

fn parse_matrix(s: &str, line_no: usize) -> Result<Vec<Vec<f64>>> {
    let inner = s.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(';')
        .map(|row| row.trim())
        .filter(|row| !row.is_empty())
        .map(|row| parse_vector(row, line_no))
        .collect()
}

fn rows_to_array(rows: Vec<Vec<f64>>, ncols: usize) -> Result<Array2<f64>> {
    let nrows = rows.len();
    let mut arr = Array2::zeros((nrows, ncols));
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != ncols {
            return Err(HmmKernelError::DimensionMismatch(format!(
                "row {i} has {} columns, expected {ncols}",
                row.len()
            )));
        }
        for (j, v) in row.into_iter().enumerate() {
            arr[[i, j]] = v;
        }
    }
    Ok(arr)
}

fn parse_index_list(s: &str, line_no: usize) -> Result<Vec<usize>> {
    let inner = s.trim().trim_start_matches('[').trim_end_matches(']');
    let mut out = Vec::new();
    for tok in inner.split(',') {
        let v = parse_int(tok.trim(), line_no)?;
        if v == -1 {
            break;
        }
        if v < 0 {
            return Err(HmmKernelError::IndexOutOfRange(v));
        }
        out.push(v as usize);
    }
    Ok(out)
}

fn parse_pair_list(s: &str, line_no: usize) -> Result<Vec<(usize, usize)>> {
    let mut out = Vec::new();
    for pair in extract_brackets(s) {
        let nums: Vec<i64> = pair.split(',').map(|t| parse_int(t.trim(), line_no)).collect::<Result<_>>()?;
        if nums.len() != 2 {
            return Err(HmmKernelError::IoMalformed { line: line_no, msg: "expected [i,j] pair".into() });
        }
        if nums[0] == -1 && nums[1] == -1 {
            break;
        }
        if nums[0] < 0 || nums[1] < 0 {
            return Err(HmmKernelError::IndexOutOfRange(nums[0].min(nums[1])));
        }
        out.push((nums[0] as usize, nums[1] as usize));
    }
    Ok(out)
}

fn parse_index_value_list(s: &str, line_no: usize) -> Result<Vec<(usize, f64)>> {
    let mut out = Vec::new();
    for pair in extract_brackets(s) {
        let toks: Vec<&str> = pair.split(',').map(str::trim).collect();
        if toks.len() != 2 {
            return Err(HmmKernelError::IoMalformed { line: line_no, msg: "expected [i,v] pair".into() });
        }
        let idx = parse_int(toks[0], line_no)?;
        if idx == -1 {
            break;
        }
        if idx < 0 {
            return Err(HmmKernelError::IndexOutOfRange(idx));
        }
        out.push((idx as usize, parse_float(toks[1], line_no)?));
    }
    Ok(out)
}

fn parse_triple_value_list(s: &str, line_no: usize) -> Result<Vec<(usize, usize, f64)>> {
    let mut out = Vec::new();
    for triple in extract_brackets(s) {
        let toks: Vec<&str> = triple.split(',').map(str::trim).collect();
        if toks.len() != 3 {
            return Err(HmmKernelError::IoMalformed { line: line_no, msg: "expected [i,j,v] triple".into() });
        }
        let i = parse_int(toks[0], line_no)?;
        let j = parse_int(toks[1], line_no)?;
        if i == -1 && j == -1 {
            break;
        }
        if i < 0 || j < 0 {
            return Err(HmmKernelError::IndexOutOfRange(i.min(j)));
        }
        out.push((i as usize, j as usize, parse_float(toks[2], line_no)?));
    }
    Ok(out)
}

/// Splits `[a,b];[c,d];...` into `["a,b", "c,d", ...]`.
fn extract_brackets(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in s.chars() {
        match ch {
            '[' => {
                depth += 1;
                if depth > 1 {
                    current.push(ch);
                }
            }
            ']' => {
                depth -= 1;
                if depth == 0 {
                    out.push(std::mem::take(&mut current));
                } else {
                    current.push(ch);
                }
            }
            _ if depth > 0 => current.push(ch),
            _ => {}
        }
    }
    out
}

fn join_finite(v: &[f64]) -> String {
    v.iter().map(|x| float_token(*x)).collect::<Vec<_>>().join(",")
}

fn float_token(x: f64) -> String {
    if x.is_finite() {
        format!("{x}")
    } else {
        "ALMOST_NEG_INF".to_string()
    }
}

fn matrix_to_string(m: &Array2<f64>) -> String {
    let mut out = String::from("[");
    for (i, row) in m.rows().into_iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push('[');
        out.push_str(&row.iter().map(|x| float_token(*x)).collect::<Vec<_>>().join(","));
        out.push(']');
    }
    out.push(']');
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_model_file() {
        let n = 2;
        let m = 2;
        let p = vec![0.5, 0.5];
        let q = vec![0.1, 0.1];
        let a = Array2::from_shape_vec((2, 2), vec![0.3, 0.3, 0.2, 0.4]).unwrap();
        let b = Array2::from_shape_vec((2, 2), vec![0.5, 0.5, 0.6, 0.4]).unwrap();
        let hmm = Hmm::from_dense(p, q, a, b).unwrap();
        let text = ModelFile::write(&hmm);

        let parsed = ModelFile::parse(&text).unwrap();
        assert_eq!(parsed.n, n);
        assert_eq!(parsed.m, m);
        assert!((parsed.p[0] - 0.5).abs() < 1e-9);
        assert!((parsed.a[[1, 0]] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn fields_may_appear_in_any_order_after_n_and_m() {
        let text = "M=2;\nN=2;\nb=[[0.5,0.5];[0.5,0.5]];\np=[1.0,0.0];\nq=[0.0,1.0];\na=[[0.5,0.5];[0.5,0.5]];\n";
        let parsed = ModelFile::parse(text).unwrap();
        assert_eq!(parsed.n, 2);
        assert_eq!(parsed.p, vec![1.0, 0.0]);
    }

    #[test]
    fn constraint_file_stops_at_sentinel() {
        let text = "learn_p=[0,2,-1];\nlearn_a=[[0,1];[1,2];[-1,-1]];\n";
        let c = ConstraintFile::parse(text).unwrap();
        assert_eq!(c.learn_p, vec![0, 2]);
        assert_eq!(c.learn_a, vec![(0, 1), (1, 2)]);
    }
}
