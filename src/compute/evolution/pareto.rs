//! Pareto dominance for maximized score vectors.

/// Returns `true` if `a` Pareto-dominates `b`.
///
/// `a` dominates `b` when it is at least as large in every objective and
/// strictly larger in at least one. Vectors of different lengths never
/// dominate each other.
pub fn dominates(a: &[f64], b: &[f64]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut strictly_better = false;
    for (&av, &bv) in a.iter().zip(b) {
        if av < bv {
            return false;
        }
        if av > bv {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Indices of the non-dominated points, in input order.
///
/// Equal points do not dominate each other, so duplicates all stay on the front.
pub fn non_dominated_front<T: AsRef<[f64]>>(points: &[T]) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| {
            !points
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && dominates(other.as_ref(), points[i].as_ref()))
        })
        .collect()
}
