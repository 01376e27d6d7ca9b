//! Permutation algebra for `transpose`.
//!
//! A permutation `perm` of length `N` describes `transpose(x, perm)`: output
//! axis `i` takes its data from input axis `perm[i]`.

/// Returns `true` when `perm` is a bijection on `0..perm.len()`.
pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        match seen.get_mut(axis) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

pub fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(index, &axis)| index == axis)
}

pub fn identity(rank: usize) -> Vec<usize> {
    (0..rank).collect()
}

/// `inverse(p)[p[i]] = i`.
pub fn inverse(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (index, &axis) in perm.iter().enumerate() {
        inv[axis] = index;
    }
    inv
}

/// Permutation equal to applying `first` and then `second`: `r[i] = first[second[i]]`.
///
/// Returns `None` when the ranks differ.
pub fn compose(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    second
        .iter()
        .map(|&axis| first.get(axis).copied())
        .collect()
}

/// Returns `true` when `transpose(transpose(x, first), second) == x`.
pub fn cancels(first: &[usize], second: &[usize]) -> bool {
    compose(first, second).is_some_and(|composed| is_identity(&composed))
}

/// `[shape[perm[i]] for i in 0..N]`.
pub fn apply_to_shape<T: Clone>(perm: &[usize], shape: &[T]) -> Vec<T> {
    perm.iter().map(|&axis| shape[axis].clone()).collect()
}

/// Maps every axis `a` to its position in `perm` (`inverse(perm)[a]`).
pub fn apply_to_axis_list(perm: &[usize], axes: &[usize]) -> Vec<usize> {
    let inv = inverse(perm);
    axes.iter().map(|&axis| inv[axis]).collect()
}

/// Permutation still pending on the output of a rank-dropping reduction.
///
/// `perm` is pending on the reduction input and `reduced_axes` are the
/// reduced axes in that (transposed) frame. The rewritten reduction works on
/// the untransposed input, so its kept axes come out in ascending source
/// order; the result maps them back to the original output order.
pub fn restrict_after_reduction(perm: &[usize], reduced_axes: &[usize]) -> Vec<usize> {
    let kept: Vec<usize> = (0..perm.len())
        .filter(|axis| !reduced_axes.contains(axis))
        .collect();
    let mut kept_source: Vec<usize> = kept.iter().map(|&axis| perm[axis]).collect();
    kept_source.sort_unstable();
    kept.iter()
        .filter_map(|&axis| kept_source.iter().position(|&src| src == perm[axis]))
        .collect()
}
