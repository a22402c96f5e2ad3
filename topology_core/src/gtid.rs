//! Transaction identifier sets
//!
//! A [`GtidSet`] is the set of globally unique transaction identifiers an
//! instance has executed, written as `source:1-5:7,other:1-3`. Each source
//! maps to a sorted list of disjoint, non-adjacent inclusive intervals.
//!
//! On top of the set arithmetic this module implements the consistency
//! checks used by rejoin, reboot, removal and failover: [`compare`],
//! [`assess`] and [`choose_recovery`].

use crate::error::{Result, TopologyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Inclusive interval of transaction numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Add the interval `start..=end` of `source`
    pub fn add_interval(&mut self, source: &str, start: u64, end: u64) {
        if start == 0 || end < start {
            return;
        }
        let intervals = self.sources.entry(source.to_ascii_lowercase()).or_default();
        intervals.push(Interval { start, end });
        normalize(intervals);
    }

    /// Append `count` new transactions of `source` after its highest number
    pub fn extend(&mut self, source: &str, count: u64) {
        if count == 0 {
            return;
        }
        let next = self.last_transaction(source).unwrap_or(0) + 1;
        self.add_interval(source, next, next + count - 1);
    }

    pub fn last_transaction(&self, source: &str) -> Option<u64> {
        self.sources
            .get(&source.to_ascii_lowercase())
            .and_then(|intervals| intervals.last())
            .map(|interval| interval.end)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|s| s.as_str())
    }

    /// Number of transactions in the set
    pub fn count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(|interval| interval.end - interval.start + 1)
            .sum()
    }

    pub fn contains(&self, source: &str, number: u64) -> bool {
        self.sources
            .get(&source.to_ascii_lowercase())
            .map(|intervals| intervals.iter().any(|i| i.start <= number && number <= i.end))
            .unwrap_or(false)
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (source, intervals) in &other.sources {
            let entry = result.sources.entry(source.clone()).or_default();
            entry.extend(intervals.iter().copied());
            normalize(entry);
        }
        result
    }

    /// Transactions in `self` that are not in `other`
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (source, intervals) in &self.sources {
            let remaining = match other.sources.get(source) {
                Some(removed) => subtract_intervals(intervals, removed),
                None => intervals.clone(),
            };
            if !remaining.is_empty() {
                result.sources.insert(source.clone(), remaining);
            }
        }
        result
    }

    pub fn intersection(&self, other: &GtidSet) -> GtidSet {
        self.subtract(&self.subtract(other))
    }

    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    pub fn parse(text: &str) -> Result<GtidSet> {
        let invalid = |reason: String| TopologyError::Validation(format!("Invalid GTID set '{}': {}", text.trim(), reason));
        let mut set = GtidSet::new();

        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        for item in cleaned.split(',').filter(|item| !item.is_empty()) {
            let mut parts = item.split(':');
            let source = parts.next().unwrap_or_default();
            if source.is_empty() {
                return Err(invalid("missing source identifier".to_string()));
            }
            let mut has_interval = false;
            for part in parts {
                has_interval = true;
                let (start, end) = match part.split_once('-') {
                    Some((start, end)) => (start, end),
                    None => (part, part),
                };
                let start: u64 = start
                    .parse()
                    .map_err(|_| invalid(format!("bad transaction number '{}'", start)))?;
                let end: u64 = end.parse().map_err(|_| invalid(format!("bad transaction number '{}'", end)))?;
                if start == 0 || end < start {
                    return Err(invalid(format!("bad interval '{}'", part)));
                }
                set.add_interval(source, start, end);
            }
            if !has_interval {
                return Err(invalid(format!("source '{}' has no intervals", source)));
            }
        }

        Ok(set)
    }
}

fn normalize(intervals: &mut Vec<Interval>) {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    *intervals = merged;
}

fn subtract_intervals(from: &[Interval], removed: &[Interval]) -> Vec<Interval> {
    let mut result = Vec::new();
    for interval in from {
        let mut start = interval.start;
        let end = interval.end;
        for cut in removed {
            if cut.end < start || cut.start > end {
                continue;
            }
            if cut.start > start {
                result.push(Interval {
                    start,
                    end: cut.start - 1,
                });
            }
            start = cut.end.saturating_add(1);
            if start > end {
                break;
            }
        }
        if start <= end {
            result.push(Interval { start, end });
        }
    }
    result
}

impl FromStr for GtidSet {
    type Err = TopologyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GtidSet::parse(s)
    }
}

impl TryFrom<String> for GtidSet {
    type Error = TopologyError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        GtidSet::parse(&value)
    }
}

impl From<GtidSet> for String {
    fn from(value: GtidSet) -> Self {
        value.to_string()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", source)?;
            for interval in intervals {
                if interval.start == interval.end {
                    write!(f, ":{}", interval.start)?;
                } else {
                    write!(f, ":{}-{}", interval.start, interval.end)?;
                }
            }
        }
        Ok(())
    }
}

/// Relation between two executed sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GtidRelation {
    Equal,
    /// The first set contains the second and more
    ASuperset,
    /// The second set contains the first and more
    BSuperset,
    /// Each set holds transactions the other lacks
    Divergent,
}

pub fn compare(a: &GtidSet, b: &GtidSet) -> GtidRelation {
    let a_only = a.subtract(b);
    let b_only = b.subtract(a);
    match (a_only.is_empty(), b_only.is_empty()) {
        (true, true) => GtidRelation::Equal,
        (false, true) => GtidRelation::ASuperset,
        (true, false) => GtidRelation::BSuperset,
        (false, false) => GtidRelation::Divergent,
    }
}

/// Transactions of `instance` that no other member has
pub fn unreplicated(instance: &GtidSet, others: &[&GtidSet]) -> GtidSet {
    let everyone_else = others.iter().fold(GtidSet::new(), |acc, set| acc.union(set));
    instance.subtract(&everyone_else)
}

/// How state is transferred to a joining instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMethod {
    /// Incremental when safe, clone otherwise
    #[default]
    Auto,
    /// Replay the missing binary log events
    Incremental,
    /// Full physical copy from a donor
    Clone,
}

impl FromStr for RecoveryMethod {
    type Err = TopologyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RecoveryMethod::Auto),
            "incremental" => Ok(RecoveryMethod::Incremental),
            "clone" => Ok(RecoveryMethod::Clone),
            other => Err(TopologyError::Validation(format!(
                "Invalid recovery method '{}': expected auto, incremental or clone",
                other
            ))),
        }
    }
}

impl fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryMethod::Auto => "auto",
            RecoveryMethod::Incremental => "incremental",
            RecoveryMethod::Clone => "clone",
        };
        f.write_str(name)
    }
}

/// State of an instance's executed set relative to a donor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GtidAssessment {
    /// Nothing to transfer
    Identical,
    /// Missing transactions are all still available on the donor
    Recoverable { missing: GtidSet },
    /// Empty executed set; the instance has never been provisioned
    NotProvisioned { missing_purged: GtidSet },
    /// Some missing transactions were purged from the donor's binary logs
    Irrecoverable { missing_purged: GtidSet },
    /// The instance has transactions the donor never executed
    Diverged { errant: GtidSet },
}

impl GtidAssessment {
    pub fn is_compatible(&self) -> bool {
        matches!(self, GtidAssessment::Identical | GtidAssessment::Recoverable { .. })
    }
}

/// Compare `instance` against a donor's executed and purged sets
pub fn assess(instance: &GtidSet, donor_executed: &GtidSet, donor_purged: &GtidSet) -> GtidAssessment {
    let errant = instance.subtract(donor_executed);
    if !errant.is_empty() {
        return GtidAssessment::Diverged { errant };
    }

    let missing = donor_executed.subtract(instance);
    if missing.is_empty() {
        return GtidAssessment::Identical;
    }

    let missing_purged = missing.intersection(donor_purged);
    if instance.is_empty() {
        return GtidAssessment::NotProvisioned { missing_purged };
    }
    if !missing_purged.is_empty() {
        return GtidAssessment::Irrecoverable { missing_purged };
    }

    GtidAssessment::Recoverable { missing }
}

/// Resolve the requested recovery method against an assessment.
///
/// `Auto` prefers incremental recovery and falls back to clone when the
/// instance is empty or needs purged transactions. Errant transactions are
/// only accepted with an explicit `Clone`, which overwrites them.
pub fn choose_recovery(
    address: &str,
    assessment: &GtidAssessment,
    requested: RecoveryMethod,
    clone_disabled: bool,
) -> Result<RecoveryMethod> {
    if requested == RecoveryMethod::Clone && clone_disabled {
        return Err(TopologyError::Validation(
            "Clone based recovery was requested but clone is disabled for this cluster".to_string(),
        ));
    }

    match assessment {
        GtidAssessment::Identical | GtidAssessment::Recoverable { .. } => Ok(match requested {
            RecoveryMethod::Clone => RecoveryMethod::Clone,
            _ => RecoveryMethod::Incremental,
        }),
        GtidAssessment::NotProvisioned { missing_purged } => match requested {
            RecoveryMethod::Clone => Ok(RecoveryMethod::Clone),
            RecoveryMethod::Incremental | RecoveryMethod::Auto if missing_purged.is_empty() && (clone_disabled || requested == RecoveryMethod::Incremental) => {
                Ok(RecoveryMethod::Incremental)
            }
            RecoveryMethod::Auto if !clone_disabled => Ok(RecoveryMethod::Clone),
            _ => Err(TopologyError::Consistency(format!(
                "The instance '{}' has an empty GTID set and the transactions '{}' required for incremental recovery were purged; use clone recovery",
                address, missing_purged
            ))),
        },
        GtidAssessment::Irrecoverable { missing_purged } => match requested {
            RecoveryMethod::Auto if !clone_disabled => Ok(RecoveryMethod::Clone),
            RecoveryMethod::Clone => Ok(RecoveryMethod::Clone),
            _ => Err(TopologyError::Consistency(format!(
                "The instance '{}' is missing transactions '{}' that were purged from all members; only clone recovery can provision it",
                address, missing_purged
            ))),
        },
        GtidAssessment::Diverged { errant } => match requested {
            RecoveryMethod::Clone => {
                tracing::warn!(
                    "Errant transactions '{}' on '{}' will be overwritten by clone recovery",
                    errant,
                    address
                );
                Ok(RecoveryMethod::Clone)
            }
            _ => Err(TopologyError::Consistency(format!(
                "The instance '{}' has errant transactions '{}' that do not exist in the cluster; they must be removed or the instance provisioned with clone recovery",
                address, errant
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "aaaaaaaa-0000-0000-0000-000000000001";
    const B: &str = "bbbbbbbb-0000-0000-0000-000000000002";

    fn set(text: &str) -> GtidSet {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_normalizes() {
        let s = set(&format!("{}:7:1-3:4-5, {}:2", A, B));
        assert_eq!(s.to_string(), format!("{}:1-5:7,{}:2", A, B));
        assert_eq!(s.count(), 7);
        assert!(set("").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GtidSet::parse(&format!("{}:0", A)).is_err());
        assert!(GtidSet::parse(&format!("{}:5-2", A)).is_err());
        assert!(GtidSet::parse(A).is_err());
        assert!(GtidSet::parse(&format!("{}:x", A)).is_err());
    }

    #[test]
    fn test_subtract_splits_intervals() {
        let s = set(&format!("{}:1-10", A));
        let diff = s.subtract(&set(&format!("{}:3-4:8", A)));
        assert_eq!(diff.to_string(), format!("{}:1-2:5-7:9-10", A));
        assert!(s.subtract(&s).is_empty());
    }

    #[test]
    fn test_union_and_intersection() {
        let a = set(&format!("{}:1-5", A));
        let b = set(&format!("{}:4-8,{}:1", A, B));
        assert_eq!(a.union(&b).to_string(), format!("{}:1-8,{}:1", A, B));
        assert_eq!(a.intersection(&b).to_string(), format!("{}:4-5", A));
    }

    #[test]
    fn test_compare_relations() {
        let base = set(&format!("{}:1-5", A));
        let ahead = set(&format!("{}:1-8", A));
        let errant = set(&format!("{}:1-5,{}:1", A, B));

        assert_eq!(compare(&base, &base.clone()), GtidRelation::Equal);
        assert_eq!(compare(&ahead, &base), GtidRelation::ASuperset);
        assert_eq!(compare(&base, &ahead), GtidRelation::BSuperset);
        assert_eq!(compare(&ahead, &errant), GtidRelation::Divergent);
    }

    #[test]
    fn test_extend_appends_after_highest() {
        let mut s = set(&format!("{}:1-3", A));
        s.extend(A, 2);
        assert_eq!(s.to_string(), format!("{}:1-5", A));
        s.extend(B, 1);
        assert!(s.contains(B, 1));
    }

    #[test]
    fn test_assess_outcomes() {
        let donor = set(&format!("{}:1-100", A));
        let purged = set(&format!("{}:1-50", A));

        assert_eq!(assess(&donor, &donor, &purged), GtidAssessment::Identical);
        assert!(matches!(
            assess(&set(&format!("{}:1-60", A)), &donor, &purged),
            GtidAssessment::Recoverable { .. }
        ));
        assert!(matches!(
            assess(&set(&format!("{}:1-20", A)), &donor, &purged),
            GtidAssessment::Irrecoverable { .. }
        ));
        assert!(matches!(
            assess(&GtidSet::new(), &donor, &purged),
            GtidAssessment::NotProvisioned { .. }
        ));
        match assess(&set(&format!("{}:1-100,{}:1-2", A, B)), &donor, &purged) {
            GtidAssessment::Diverged { errant } => assert_eq!(errant.to_string(), format!("{}:1-2", B)),
            other => panic!("unexpected assessment {:?}", other),
        }
    }

    #[test]
    fn test_choose_recovery_auto() {
        let donor = set(&format!("{}:1-100", A));
        let nothing_purged = GtidSet::new();
        let purged = set(&format!("{}:1-50", A));

        let recoverable = assess(&set(&format!("{}:1-60", A)), &donor, &purged);
        assert_eq!(
            choose_recovery("h1:3306", &recoverable, RecoveryMethod::Auto, false).unwrap(),
            RecoveryMethod::Incremental
        );

        let empty = assess(&GtidSet::new(), &donor, &nothing_purged);
        assert_eq!(
            choose_recovery("h1:3306", &empty, RecoveryMethod::Auto, false).unwrap(),
            RecoveryMethod::Clone
        );
        assert_eq!(
            choose_recovery("h1:3306", &empty, RecoveryMethod::Auto, true).unwrap(),
            RecoveryMethod::Incremental
        );

        let lost = assess(&set(&format!("{}:1-20", A)), &donor, &purged);
        assert_eq!(
            choose_recovery("h1:3306", &lost, RecoveryMethod::Auto, false).unwrap(),
            RecoveryMethod::Clone
        );
        assert!(choose_recovery("h1:3306", &lost, RecoveryMethod::Incremental, false).is_err());
        assert!(choose_recovery("h1:3306", &lost, RecoveryMethod::Auto, true).is_err());
    }

    #[test]
    fn test_errant_transactions_require_explicit_clone() {
        let donor = set(&format!("{}:1-10", A));
        let diverged = assess(&set(&format!("{}:1-10,{}:1", A, B)), &donor, &GtidSet::new());

        let err = choose_recovery("h2:3306", &diverged, RecoveryMethod::Auto, false).unwrap_err();
        assert!(err.to_string().contains("errant transactions"));
        assert_eq!(
            choose_recovery("h2:3306", &diverged, RecoveryMethod::Clone, false).unwrap(),
            RecoveryMethod::Clone
        );
    }

    #[test]
    fn test_unreplicated() {
        let mine = set(&format!("{}:1-10,{}:1-3", A, B));
        let other1 = set(&format!("{}:1-10", A));
        let other2 = set(&format!("{}:1-2", B));
        assert_eq!(unreplicated(&mine, &[&other1, &other2]).to_string(), format!("{}:3", B));
    }
}
