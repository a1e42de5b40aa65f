//! Disk budget enforcement for sealed log segments.
//!
//! Segments are ranked into retention classes. When more segments exist than
//! the budget allows, the lowest class goes first and, within a class, the
//! oldest segment.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// A sealed segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub number: u64,
    pub path: PathBuf,
    pub has_failure: bool,
}

/// How much a segment is worth keeping, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RetentionClass {
    Expendable,
    /// Immediately before a segment that contains a failure
    PrecedesFailure,
    Failure,
    MostRecent,
    /// Part of the unbroken run of segments leading up to the first failure
    ChainToFirstFailure,
    FirstFailure,
}

/// Tracks sealed segments and prunes them to a segment budget
#[derive(Debug)]
pub struct RetentionManager {
    max_segments: usize,
    retained: Vec<SegmentInfo>,
    first_failure: Option<u64>,
    failing: BTreeSet<u64>,
}

impl RetentionManager {
    /// Budget is `total_space / segment_space` segments, never below two
    pub fn new(total_space: u64, segment_space: u64) -> Self {
        let max_segments = (total_space / segment_space.max(1)).max(2) as usize;
        Self {
            max_segments,
            retained: Vec::new(),
            first_failure: None,
            failing: BTreeSet::new(),
        }
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn retained(&self) -> &[SegmentInfo] {
        &self.retained
    }

    pub fn first_failure(&self) -> Option<u64> {
        self.first_failure
    }

    /// Register a freshly sealed segment
    pub fn register(&mut self, segment: SegmentInfo) {
        if segment.has_failure {
            self.failing.insert(segment.number);
            if self.first_failure.is_none() {
                self.first_failure = Some(segment.number);
            }
        }
        self.retained.push(segment);
    }

    pub fn classify(&self, number: u64) -> RetentionClass {
        if self.first_failure == Some(number) {
            return RetentionClass::FirstFailure;
        }
        if let Some(first) = self.first_failure {
            if number < first && self.unbroken_between(number, first) {
                return RetentionClass::ChainToFirstFailure;
            }
        }
        if self.retained.last().map(|s| s.number) == Some(number) {
            return RetentionClass::MostRecent;
        }
        if self.failing.contains(&number) {
            return RetentionClass::Failure;
        }
        if self.failing.contains(&(number + 1)) {
            return RetentionClass::PrecedesFailure;
        }
        RetentionClass::Expendable
    }

    /// True when every segment from `from` up to `to` is still retained
    fn unbroken_between(&self, from: u64, to: u64) -> bool {
        (from..to).all(|n| self.retained.iter().any(|s| s.number == n))
    }

    /// Segments that must go to fit within `slots` retained segments
    pub fn select_victims(&self, slots: usize) -> Vec<SegmentInfo> {
        let excess = self.retained.len().saturating_sub(slots);
        if excess == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<_> = self
            .retained
            .iter()
            .map(|s| (self.classify(s.number), s.number, s))
            .collect();
        ranked.sort_by_key(|(class, number, _)| (*class, *number));
        ranked
            .into_iter()
            .take(excess)
            .map(|(_, _, s)| s.clone())
            .collect()
    }

    /// Delete segments over budget.
    ///
    /// With `reserve_active` one slot is kept free for the segment being
    /// written. Returns the segments removed from the retained set.
    pub fn enforce(&mut self, reserve_active: bool) -> Vec<SegmentInfo> {
        let slots = if reserve_active {
            self.max_segments - 1
        } else {
            self.max_segments
        };
        let victims = self.select_victims(slots);
        for victim in &victims {
            let class = self.classify(victim.number);
            match fs::remove_file(&victim.path) {
                Ok(()) => info!(
                    segment = victim.number,
                    class = %class,
                    path = %victim.path.display(),
                    "deleted execution log segment"
                ),
                Err(e) => warn!(
                    segment = victim.number,
                    path = %victim.path.display(),
                    error = %e,
                    "failed to delete execution log segment"
                ),
            }
        }
        self.retained
            .retain(|s| !victims.iter().any(|v| v.number == s.number));
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn segment(number: u64, has_failure: bool) -> SegmentInfo {
        SegmentInfo {
            number,
            path: PathBuf::from(format!("/nonexistent/executionlog.{number}")),
            has_failure,
        }
    }

    fn numbers(segments: &[SegmentInfo]) -> Vec<u64> {
        segments.iter().map(|s| s.number).collect()
    }

    #[test]
    fn test_budget_has_floor_of_two() {
        assert_eq!(RetentionManager::new(10, 10).max_segments(), 2);
        assert_eq!(RetentionManager::new(100, 0).max_segments(), 100);
        assert_eq!(RetentionManager::new(200, 20).max_segments(), 10);
    }

    #[test]
    fn test_keeps_chain_to_first_failure_and_most_recent() {
        let mut manager = RetentionManager::new(60, 10);
        for n in 1..=10 {
            manager.register(segment(n, n == 4));
        }

        let victims = manager.enforce(false);
        assert_eq!(numbers(&victims), vec![5, 6, 7, 8]);
        assert_eq!(numbers(manager.retained()), vec![1, 2, 3, 4, 9, 10]);
    }

    #[test]
    fn test_chain_is_trimmed_from_far_end() {
        let mut manager = RetentionManager::new(30, 10);
        for n in 1..=6 {
            manager.register(segment(n, n == 5));
        }

        // The most recent segment ranks below the chain to the first failure
        let victims = manager.enforce(false);
        assert_eq!(numbers(&victims), vec![6, 1, 2]);
        assert_eq!(numbers(manager.retained()), vec![3, 4, 5]);
    }

    #[test]
    fn test_active_segment_reserves_a_slot() {
        let mut manager = RetentionManager::new(30, 10);
        for n in 1..=3 {
            manager.register(segment(n, false));
        }
        assert!(manager.enforce(false).is_empty());
        assert_eq!(numbers(&manager.enforce(true)), vec![1]);
    }

    #[rstest]
    #[case(4, RetentionClass::FirstFailure)]
    #[case(3, RetentionClass::ChainToFirstFailure)]
    #[case(8, RetentionClass::Failure)]
    #[case(7, RetentionClass::PrecedesFailure)]
    #[case(10, RetentionClass::MostRecent)]
    #[case(5, RetentionClass::Expendable)]
    fn test_classes(#[case] number: u64, #[case] expected: RetentionClass) {
        let mut manager = RetentionManager::new(1000, 10);
        for n in 1..=10 {
            manager.register(segment(n, n == 4 || n == 8));
        }
        assert_eq!(manager.classify(number), expected);
    }

    #[test]
    fn test_later_failures_outrank_plain_segments() {
        let mut manager = RetentionManager::new(40, 10);
        for n in 1..=8 {
            manager.register(segment(n, n == 2 || n == 6));
        }
        // Classes: 1 chain, 2 first, 3 4 expendable, 5 precedes, 6 failure, 7 expendable, 8 recent
        let victims = manager.enforce(false);
        assert_eq!(numbers(&victims), vec![3, 4, 7, 5]);
        assert_eq!(numbers(manager.retained()), vec![1, 2, 6, 8]);
    }
}
