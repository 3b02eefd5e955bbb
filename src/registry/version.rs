//! Dot-separated version comparison.

use std::cmp::Ordering;

/// Compare two versions component by component. Each component is read as
/// its leading digits (`"2-beta"` is `2`), anything else counts as `0`, and
/// missing components are `0`, so `1.2` equals `1.2.0`.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = components(left);
    let right = components(right);
    let len = left.len().max(right.len());

    (0..len)
        .map(|index| {
            let a = left.get(index).copied().unwrap_or(0);
            let b = right.get(index).copied().unwrap_or(0);
            a.cmp(&b)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// `true` when `candidate` is strictly newer than `current`.
pub fn is_version_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
