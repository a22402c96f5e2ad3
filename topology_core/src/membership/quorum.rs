//! Quorum arithmetic and failover candidate ranking

use crate::address::InstanceAddress;
use crate::error::{Result, TopologyError};
use crate::gtid::{compare, GtidRelation, GtidSet};

/// A group accepts writes while a strict majority of its view communicates
pub fn has_quorum(reachable: usize, view_size: usize) -> bool {
    view_size > 0 && reachable * 2 > view_size
}

/// How many more members may fail before quorum is lost
pub fn fault_tolerance(online: usize) -> usize {
    online.saturating_sub(1) / 2
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub address: InstanceAddress,
    pub gtid_executed: GtidSet,
    /// Lower is preferred
    pub priority: u32,
    pub server_id: u32,
}

fn tie_break(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.server_id.cmp(&b.server_id))
        .then(a.address.cmp(&b.address))
}

/// Order candidates best first.
///
/// The most advanced transaction set wins; candidates holding equal sets are
/// ordered by priority, server id and address. Two most-advanced candidates
/// whose sets diverge cannot be ranked and fail the call.
pub fn rank_candidates(candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
    if candidates.is_empty() {
        return Err(TopologyError::Quorum("No eligible candidate is reachable".to_string()));
    }

    let (mut leaders, mut behind): (Vec<Candidate>, Vec<Candidate>) = candidates.iter().cloned().partition(|c| {
        !candidates
            .iter()
            .any(|other| compare(&other.gtid_executed, &c.gtid_executed) == GtidRelation::ASuperset)
    });

    for (i, a) in leaders.iter().enumerate() {
        if let Some(b) = leaders[i + 1..]
            .iter()
            .find(|b| compare(&a.gtid_executed, &b.gtid_executed) == GtidRelation::Divergent)
        {
            return Err(TopologyError::Consistency(format!(
                "Instances '{}' and '{}' have diverging transaction sets and neither can be selected automatically. \
                 Specify the instance to promote explicitly.",
                a.address, b.address
            )));
        }
    }

    leaders.sort_by(tie_break);
    behind.sort_by(|a, b| {
        b.gtid_executed
            .count()
            .cmp(&a.gtid_executed.count())
            .then_with(|| tie_break(a, b))
    });
    leaders.extend(behind);
    Ok(leaders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn candidate(addr: &str, gtid: &str, priority: u32, server_id: u32) -> Candidate {
        Candidate {
            address: addr.parse().unwrap(),
            gtid_executed: gtid.parse().unwrap(),
            priority,
            server_id,
        }
    }

    #[test]
    fn test_quorum_math() {
        assert!(has_quorum(2, 3));
        assert!(!has_quorum(1, 3));
        assert!(!has_quorum(2, 4));
        assert!(has_quorum(1, 1));
        assert!(!has_quorum(0, 0));

        assert_eq!(fault_tolerance(1), 0);
        assert_eq!(fault_tolerance(2), 0);
        assert_eq!(fault_tolerance(3), 1);
        assert_eq!(fault_tolerance(5), 2);
    }

    #[test]
    fn test_most_advanced_wins() {
        let ranked = rank_candidates(vec![
            candidate("a:1", "g:1-5", 1, 1),
            candidate("b:1", "g:1-9", 90, 2),
        ])
        .unwrap();
        assert_eq!(ranked[0].address.to_string(), "b:1");
    }

    #[test]
    fn test_ties_break_on_priority_then_id() {
        let ranked = rank_candidates(vec![
            candidate("c:1", "g:1-5", 50, 3),
            candidate("a:1", "g:1-5", 50, 7),
            candidate("b:1", "g:1-5", 10, 9),
        ])
        .unwrap();
        let order: Vec<String> = ranked.iter().map(|c| c.address.to_string()).collect();
        assert_eq!(order, vec!["b:1", "c:1", "a:1"]);
    }

    #[test]
    fn test_divergent_leaders_rejected() {
        let err = rank_candidates(vec![
            candidate("a:1", "g:1-5,x:1", 1, 1),
            candidate("b:1", "g:1-5,y:1", 1, 2),
            candidate("c:1", "g:1-3", 1, 3),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }
}
