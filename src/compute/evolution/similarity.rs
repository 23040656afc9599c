//! Structural similarity between candidate source texts.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|[0-9]+(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?|\S")
        .expect("token pattern is valid")
});

/// Token stream with numeric literals collapsed, so changing a constant does
/// not change the structure.
fn tokens(source: &str) -> Vec<&str> {
    TOKEN
        .find_iter(source)
        .map(|m| {
            let token = m.as_str();
            if token.as_bytes()[0].is_ascii_digit() {
                "0"
            } else {
                token
            }
        })
        .collect()
}

fn shingles<'a>(tokens: &[&'a str]) -> HashSet<(&'a str, &'a str)> {
    if tokens.len() == 1 {
        return HashSet::from([(tokens[0], "")]);
    }
    tokens.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Jaccard similarity of token bigrams, in `[0, 1]`.
///
/// Identical programs score 1, programs sharing no adjacent token pair score 0.
/// Two empty texts are identical.
pub fn structural_similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }

    let sa = shingles(&ta);
    let sb = shingles(&tb);
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_and_disjoint() {
        let src = "int f(int x) { return x + 1; }";
        assert_eq!(structural_similarity(src, src), 1.0);
        assert_eq!(structural_similarity("a b", "c d"), 0.0);
        assert_eq!(structural_similarity("", ""), 1.0);
    }

    #[test]
    fn test_constants_do_not_change_structure() {
        let a = "if (load > 0.75) { rebalance(3); }";
        let b = "if (load > 0.9) { rebalance(12); }";
        assert_eq!(structural_similarity(a, b), 1.0);
    }

    #[test]
    fn test_partial_overlap() {
        let a = "x = a + b;";
        let b = "x = a * b;";
        let s = structural_similarity(a, b);
        assert!(s > 0.0 && s < 1.0);
    }

    proptest! {
        #[test]
        fn test_similarity_bounded_and_symmetric(a in "[a-z0-9 +;(){}]{0,40}", b in "[a-z0-9 +;(){}]{0,40}") {
            let ab = structural_similarity(&a, &b);
            let ba = structural_similarity(&b, &a);
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-12);
        }
    }
}
