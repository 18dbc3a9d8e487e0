//! Baseline/noise subtraction.
//!
//! The activity view keeps returning queries that were already running when
//! tracking began, plus whatever the connection has marked as noise.
//! [`diff`] removes both, comparing case-insensitively, and drops blank
//! entries. Surviving strings keep their original text.

use std::collections::{BTreeSet, HashSet};

/// Returns the observed queries that are neither in `baseline` nor in `noise`.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
/// use dblistener_tracker::differ::diff;
///
/// let observed = BTreeSet::from(["select 1".to_string(), "select a,b from t".to_string()]);
/// let baseline = BTreeSet::from(["SELECT 1".to_string()]);
///
/// let candidates = diff(&observed, &baseline, &BTreeSet::<String>::new());
/// assert_eq!(candidates, BTreeSet::from(["select a,b from t".to_string()]));
/// ```
#[must_use]
pub fn diff<S: AsRef<str>>(
    observed: &BTreeSet<String>,
    baseline: &BTreeSet<String>,
    noise: impl IntoIterator<Item = S>,
) -> BTreeSet<String> {
    let mut known: HashSet<String> = baseline.iter().map(|q| q.to_lowercase()).collect();
    known.extend(noise.into_iter().map(|q| q.as_ref().to_lowercase()));

    observed
        .iter()
        .filter(|query| !query.trim().is_empty())
        .filter(|query| !known.contains(&query.to_lowercase()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn baseline_is_removed() {
        let candidates = diff(
            &set(&["select 1", "select a,b from t"]),
            &set(&["select 1"]),
            Vec::<String>::new(),
        );
        assert_eq!(candidates, set(&["select a,b from t"]));
    }

    #[test]
    fn noise_is_removed_case_insensitively() {
        let candidates = diff(
            &set(&["SELECT 1", "select x from y"]),
            &BTreeSet::new(),
            ["select 1"],
        );
        assert_eq!(candidates, set(&["select x from y"]));
    }

    #[test]
    fn blank_entries_are_dropped() {
        let candidates = diff(&set(&["", "   ", "\n\t", "select 2"]), &BTreeSet::new(), [""; 0]);
        assert_eq!(candidates, set(&["select 2"]));
    }

    #[test]
    fn original_text_is_kept() {
        let candidates = diff(&set(&["SELECT Name FROM Users"]), &BTreeSet::new(), [""; 0]);
        assert_eq!(candidates, set(&["SELECT Name FROM Users"]));
    }

    proptest! {
        #[test]
        fn output_excludes_known_and_blank(
            observed in proptest::collection::btree_set("[ a-zA-Z0-9]{0,8}", 0..20),
            baseline in proptest::collection::btree_set("[ a-zA-Z0-9]{0,8}", 0..10),
            noise in proptest::collection::vec("[ a-zA-Z0-9]{0,8}", 0..10),
        ) {
            let candidates = diff(&observed, &baseline, &noise);

            for candidate in &candidates {
                prop_assert!(!candidate.trim().is_empty());
                prop_assert!(observed.contains(candidate));
                let lowered = candidate.to_lowercase();
                prop_assert!(!baseline.iter().any(|b| b.to_lowercase() == lowered));
                prop_assert!(!noise.iter().any(|n| n.to_lowercase() == lowered));
            }
        }

        #[test]
        fn diff_is_deterministic(
            observed in proptest::collection::btree_set("[a-z ]{0,6}", 0..20),
            baseline in proptest::collection::btree_set("[a-z ]{0,6}", 0..10),
        ) {
            let empty: [&str; 0] = [];
            prop_assert_eq!(
                diff(&observed, &baseline, empty),
                diff(&observed, &baseline, empty)
            );
        }
    }
}
