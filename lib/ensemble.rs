//! Stacks of operators and magnetizations carrying an explicit leading replica
//! axis.
//!
//! RF inhomogeneity and coupling multiplets turn a single generator into a
//! weighted ensemble of generators. Every array here carries that ensemble as
//! its first axis; a length-1 axis stands for "the same for all replicas".
//!
//! Two stacks of lengths `a` and `b` are compatible when the lengths are equal,
//! when either is 1, or when the shorter divides the longer. In the last case
//! replica `r` of the longer stack pairs with replica `r / (long / short)` of the
//! shorter one, which matches the jeff-major, b1-minor flattening used by
//! [`Liouvillian`][crate::liouvillian::Liouvillian]: a stack over couplings
//! alone lines up with one over couplings and field strengths.

use ndarray as nd;
use crate::error::{ Error, Result };

/// Stack of superoperators, shape `(replicas, n, n)`.
pub type Operator = nd::Array3<f64>;

/// Stack of magnetization vectors, shape `(replicas, n)`.
pub type Magnetization = nd::Array2<f64>;

/// Operators indexed first by delay or phase, shape `(k, replicas, n, n)`.
pub type Propagators = nd::Array4<f64>;

/// Length of the stack obtained by combining stacks of lengths `a` and `b`.
pub fn broadcast_len(a: usize, b: usize) -> Result<usize> {
    let (short, long) = if a <= b { (a, b) } else { (b, a) };
    if short == 0 {
        Err(Error::Replicas(a, b))
    } else if long % short == 0 {
        Ok(long)
    } else {
        Err(Error::Replicas(a, b))
    }
}

// index into a stack of length `len` for replica `r` of a broadcast stack of
// length `total`
fn source(r: usize, len: usize, total: usize) -> usize { r / (total / len) }

/// Identity operator for a single replica.
pub fn identity(n: usize) -> Operator {
    nd::Array2::eye(n).insert_axis(nd::Axis(0))
}

/// Promote a single matrix to a one-replica stack.
pub fn single(matrix: nd::Array2<f64>) -> Operator {
    matrix.insert_axis(nd::Axis(0))
}

/// Replica-wise matrix product `a · b`.
pub fn dot(a: nd::ArrayView3<f64>, b: nd::ArrayView3<f64>) -> Result<Operator>
{
    let (ra, n, _) = a.dim();
    let (rb, m, _) = b.dim();
    if n != m { return Err(Error::Dimension { expected: n, got: m }); }
    let r = broadcast_len(ra, rb)?;
    let mut out: Operator = nd::Array3::zeros((r, n, n));
    for (k, mut o) in out.outer_iter_mut().enumerate() {
        let ak = a.index_axis(nd::Axis(0), source(k, ra, r));
        let bk = b.index_axis(nd::Axis(0), source(k, rb, r));
        o.assign(&ak.dot(&bk));
    }
    Ok(out)
}

/// Product of a sequence of stacks, `ops[0] · ops[1] · ...`.
///
/// Operators apply right to left, so the last element acts first.
pub fn chain(ops: &[nd::ArrayView3<f64>]) -> Result<Operator> {
    let Some((first, rest)) = ops.split_first() else {
        return Err(Error::Replicas(0, 0));
    };
    rest.iter()
        .try_fold(first.to_owned(), |acc, op| dot(acc.view(), op.view()))
}

/// Replica-wise product of two propagator sets, broadcasting both the leading
/// (delay/phase) axis and the replica axis.
pub fn dot_sets(a: nd::ArrayView4<f64>, b: nd::ArrayView4<f64>)
    -> Result<Propagators>
{
    let ka = a.len_of(nd::Axis(0));
    let kb = b.len_of(nd::Axis(0));
    let k = broadcast_len(ka, kb)?;
    let products: Vec<Operator>
        = (0..k)
        .map(|i| {
            dot(
                a.index_axis(nd::Axis(0), source(i, ka, k)),
                b.index_axis(nd::Axis(0), source(i, kb, k)),
            )
        })
        .collect::<Result<_>>()?;
    let views: Vec<nd::ArrayView3<f64>>
        = products.iter().map(|p| p.view()).collect();
    Ok(nd::stack(nd::Axis(0), &views)?)
}

/// Apply an operator stack to a magnetization stack.
pub fn apply(op: nd::ArrayView3<f64>, mag: nd::ArrayView2<f64>)
    -> Result<Magnetization>
{
    let (ro, n, _) = op.dim();
    let (rm, m) = mag.dim();
    if n != m { return Err(Error::Dimension { expected: n, got: m }); }
    let r = broadcast_len(ro, rm)?;
    let mut out: Magnetization = nd::Array2::zeros((r, n));
    for (k, mut o) in out.outer_iter_mut().enumerate() {
        let opk = op.index_axis(nd::Axis(0), source(k, ro, r));
        let magk = mag.index_axis(nd::Axis(0), source(k, rm, r));
        o.assign(&opk.dot(&magk));
    }
    Ok(out)
}

/// Raise every replica to the `k`-th power by repeated squaring.
pub fn power(op: nd::ArrayView3<f64>, k: usize) -> Operator {
    let (r, n, _) = op.dim();
    let mut out: Operator = nd::Array3::zeros((r, n, n));
    for (mut o, m) in out.outer_iter_mut().zip(op.outer_iter()) {
        let mut acc: nd::Array2<f64> = nd::Array2::eye(n);
        let mut base: nd::Array2<f64> = m.to_owned();
        let mut e = k;
        while e > 0 {
            if e & 1 == 1 { acc = acc.dot(&base); }
            e >>= 1;
            if e > 0 { base = base.dot(&base); }
        }
        o.assign(&acc);
    }
    out
}

/// Reduce a magnetization stack to a single vector with the replica weights.
///
/// A stack shorter than the weights (but dividing it) gets the aggregated
/// weights of the replicas it stands for; a one-replica stack is returned as is.
pub fn collapse(mag: nd::ArrayView2<f64>, weights: nd::ArrayView1<f64>)
    -> Result<nd::Array1<f64>>
{
    let r = mag.len_of(nd::Axis(0));
    let w = weights.len();
    if r == 1 {
        return Ok(mag.index_axis(nd::Axis(0), 0).to_owned());
    }
    if r == 0 || w < r || w % r != 0 {
        return Err(Error::Replicas(r, w));
    }
    let mut agg: nd::Array1<f64> = nd::Array1::zeros(r);
    weights.iter().enumerate()
        .for_each(|(k, wk)| { agg[source(k, r, w)] += wk; });
    Ok(agg.dot(&mag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_len(3, 3).unwrap(), 3);
        assert_eq!(broadcast_len(1, 7).unwrap(), 7);
        assert_eq!(broadcast_len(6, 2).unwrap(), 6);
        assert!(matches!(broadcast_len(4, 6), Err(Error::Replicas(4, 6))));
    }

    #[test]
    fn short_stack_pairs_with_blocks() {
        // two couplings, three field strengths
        let a: Operator
            = nd::Array3::from_shape_fn((2, 1, 1), |(k, _, _)| (k + 1) as f64);
        let b: Operator
            = nd::Array3::from_shape_fn((6, 1, 1), |(k, _, _)| 10.0_f64.powi(k as i32));
        let ab = dot(a.view(), b.view()).unwrap();
        assert_eq!(ab.len_of(nd::Axis(0)), 6);
        assert_eq!(ab[[2, 0, 0]], 100.0);
        assert_eq!(ab[[3, 0, 0]], 2000.0);
    }

    #[test]
    fn power_matches_repeated_product() {
        let m: Operator
            = nd::array![[[0.9, 0.1], [-0.2, 0.8]]];
        let mut expected = identity(2);
        for _ in 0..5 {
            expected = dot(expected.view(), m.view()).unwrap();
        }
        let p = power(m.view(), 5);
        p.iter().zip(expected.iter())
            .for_each(|(x, y)| assert_abs_diff_eq!(x, y, epsilon = 1e-15));
        assert_eq!(power(m.view(), 0), identity(2));
    }

    #[test]
    fn collapse_aggregates_weights() {
        let weights = nd::array![0.1, 0.2, 0.3, 0.4];
        let full: Magnetization = nd::array![[1.0], [2.0], [3.0], [4.0]];
        assert_abs_diff_eq!(
            collapse(full.view(), weights.view()).unwrap()[0], 3.0,
            epsilon = 1e-15);
        let half: Magnetization = nd::array![[1.0], [2.0]];
        assert_abs_diff_eq!(
            collapse(half.view(), weights.view()).unwrap()[0], 1.7,
            epsilon = 1e-15);
        let three: Magnetization = nd::array![[1.0], [2.0], [3.0]];
        assert!(collapse(three.view(), weights.view()).is_err());
    }

    #[test]
    fn apply_checks_dimensions() {
        let op = identity(3);
        let mag: Magnetization = nd::Array2::ones((1, 2));
        assert!(matches!(
            apply(op.view(), mag.view()),
            Err(Error::Dimension { expected: 3, got: 2 }),
        ));
    }
}
