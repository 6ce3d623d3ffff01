//! Ordered chain evaluation
//!
//! iptables evaluates a chain top to bottom and the first terminating match
//! wins. Everything in fwpath that depends on rule order goes through these
//! two functions instead of sorting on its own.

use crate::core::rule::Rule;
use std::ops::ControlFlow;

/// Rules sorted by line number. The sort is stable, so rules sharing a
/// number (hand-built sets) keep their relative order.
pub fn in_evaluation_order(rules: &[Rule]) -> Vec<&Rule> {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by_key(|r| r.line_number);
    ordered
}

/// Visits rules in evaluation order until `visit` breaks.
///
/// Returns the break value, or `None` if the walk fell off the end of the
/// chain (the chain policy, or a return to the caller, decides).
pub fn walk<'a, T>(
    rules: &'a [Rule],
    mut visit: impl FnMut(&'a Rule) -> ControlFlow<T>,
) -> Option<T> {
    for rule in in_evaluation_order(rules) {
        if let ControlFlow::Break(value) = visit(rule) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::rule;

    #[test]
    fn test_walk_respects_line_numbers() {
        let rules = vec![
            rule(5, "DROP", "all", "*", "br-x"),
            rule(1, "RETURN", "all", "tun0", "br-x"),
            rule(3, "ACCEPT", "all", "tun0", "br-x"),
        ];
        let first = walk(&rules, |r| ControlFlow::Break(r.line_number));
        assert_eq!(first, Some(1));

        let mut seen = Vec::new();
        let none: Option<()> = walk(&rules, |r| {
            seen.push(r.line_number);
            ControlFlow::Continue(())
        });
        assert_eq!(none, None);
        assert_eq!(seen, [1, 3, 5]);
    }

    #[test]
    fn test_stable_for_equal_numbers() {
        let rules = vec![
            rule(1, "DROP", "all", "*", "*"),
            rule(1, "ACCEPT", "all", "*", "*"),
        ];
        let targets: Vec<_> = in_evaluation_order(&rules)
            .iter()
            .map(|r| r.target.as_str())
            .collect();
        assert_eq!(targets, ["DROP", "ACCEPT"]);
    }
}
