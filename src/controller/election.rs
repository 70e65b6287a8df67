use std::collections::HashSet;

use thiserror::Error;

use crate::message::{LeaderAndIsr, ReplicaAssignment};

/// Typed failure of an election strategy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("no eligible leader among live in-sync replicas")]
    EligibleLeadersNotAvailable,
    #[error("preferred replica {0} is not live or not in sync")]
    PreferredLeaderNotAvailable(i32),
    #[error("current leader already satisfies the election")]
    ElectionNotNeeded,
}

/// `(leader, new ISR)` produced by a successful election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    pub leader: i32,
    pub isr: Vec<i32>,
    pub unclean: bool,
}

/// Offline-partition election: the first assigned replica that is live and
/// in sync leads. With unclean fallback enabled, any live assigned replica
/// may lead, becoming the entire ISR (committed records may be lost).
pub fn elect_for_offline(
    assignment: &ReplicaAssignment,
    leadership: &LeaderAndIsr,
    live: &HashSet<i32>,
    allow_unclean: bool,
) -> Result<ElectionResult, ElectionError> {
    let candidate = assignment
        .replicas
        .iter()
        .find(|r| live.contains(r) && leadership.isr.contains(r));
    if let Some(leader) = candidate {
        let isr: Vec<i32> = leadership
            .isr
            .iter()
            .filter(|r| live.contains(r))
            .copied()
            .collect();
        return Ok(ElectionResult {
            leader: *leader,
            isr,
            unclean: false,
        });
    }
    if allow_unclean {
        if let Some(leader) = assignment.replicas.iter().find(|r| live.contains(r)) {
            return Ok(ElectionResult {
                leader: *leader,
                isr: vec![*leader],
                unclean: true,
            });
        }
    }
    Err(ElectionError::EligibleLeadersNotAvailable)
}

/// Reassignment election: leadership must move into the target replica set.
pub fn elect_for_reassignment(
    assignment: &ReplicaAssignment,
    leadership: &LeaderAndIsr,
    live: &HashSet<i32>,
) -> Result<ElectionResult, ElectionError> {
    let leader = assignment
        .target_replicas()
        .into_iter()
        .find(|r| live.contains(r) && leadership.isr.contains(r))
        .ok_or(ElectionError::EligibleLeadersNotAvailable)?;
    Ok(ElectionResult {
        leader,
        isr: leadership.isr.clone(),
        unclean: false,
    })
}

/// Preferred-replica election: only the first assigned replica may win.
pub fn elect_preferred(
    assignment: &ReplicaAssignment,
    leadership: &LeaderAndIsr,
    live: &HashSet<i32>,
) -> Result<ElectionResult, ElectionError> {
    let preferred = *assignment
        .replicas
        .first()
        .ok_or(ElectionError::EligibleLeadersNotAvailable)?;
    if leadership.leader == preferred {
        return Err(ElectionError::ElectionNotNeeded);
    }
    if !live.contains(&preferred) || !leadership.isr.contains(&preferred) {
        return Err(ElectionError::PreferredLeaderNotAvailable(preferred));
    }
    Ok(ElectionResult {
        leader: preferred,
        isr: leadership.isr.clone(),
        unclean: false,
    })
}

/// Controlled-shutdown election: move leadership off the shutting-down
/// brokers and drop them from the ISR.
pub fn elect_for_controlled_shutdown(
    assignment: &ReplicaAssignment,
    leadership: &LeaderAndIsr,
    live: &HashSet<i32>,
    shutting_down: &HashSet<i32>,
) -> Result<ElectionResult, ElectionError> {
    let leader = assignment
        .replicas
        .iter()
        .find(|r| {
            live.contains(r) && leadership.isr.contains(r) && !shutting_down.contains(r)
        })
        .copied()
        .ok_or(ElectionError::EligibleLeadersNotAvailable)?;
    let isr: Vec<i32> = leadership
        .isr
        .iter()
        .filter(|r| !shutting_down.contains(r))
        .copied()
        .collect();
    Ok(ElectionResult {
        leader,
        isr,
        unclean: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leadership(leader: i32, isr: Vec<i32>) -> LeaderAndIsr {
        LeaderAndIsr::new(leader, 3, isr, 5)
    }

    #[test]
    fn test_offline_election_prefers_assignment_order() {
        let assignment = ReplicaAssignment::new(vec![2, 1, 3]);
        let result = elect_for_offline(
            &assignment,
            &leadership(-1, vec![1, 2, 3]),
            &HashSet::from([1, 2, 3]),
            false,
        )
        .unwrap();
        assert_eq!(result.leader, 2);
        assert!(!result.unclean);
    }

    #[test]
    fn test_offline_election_filters_dead_isr() {
        let assignment = ReplicaAssignment::new(vec![1, 2, 3]);
        let result = elect_for_offline(
            &assignment,
            &leadership(1, vec![1, 2, 3]),
            &HashSet::from([2, 3]),
            false,
        )
        .unwrap();
        assert_eq!(result.leader, 2);
        assert_eq!(result.isr, vec![2, 3]);
    }

    #[test]
    fn test_unclean_election_only_when_allowed() {
        let assignment = ReplicaAssignment::new(vec![1, 2, 3]);
        let lisr = leadership(1, vec![1]);
        let live = HashSet::from([2, 3]);
        assert_eq!(
            elect_for_offline(&assignment, &lisr, &live, false).unwrap_err(),
            ElectionError::EligibleLeadersNotAvailable
        );
        let result = elect_for_offline(&assignment, &lisr, &live, true).unwrap();
        assert_eq!(result.leader, 2);
        assert_eq!(result.isr, vec![2]);
        assert!(result.unclean);
    }

    #[test]
    fn test_reassignment_election_targets_only() {
        let assignment = ReplicaAssignment::with_reassignment(
            vec![1, 2, 3, 4, 5, 6],
            vec![4, 5, 6],
            vec![1, 2, 3],
        );
        let result = elect_for_reassignment(
            &assignment,
            &leadership(1, vec![1, 2, 3, 4, 5, 6]),
            &HashSet::from([1, 2, 3, 4, 5, 6]),
        )
        .unwrap();
        assert_eq!(result.leader, 4);
    }

    #[test]
    fn test_preferred_election() {
        let assignment = ReplicaAssignment::new(vec![1, 2, 3]);
        let result = elect_preferred(
            &assignment,
            &leadership(2, vec![1, 2, 3]),
            &HashSet::from([1, 2, 3]),
        )
        .unwrap();
        assert_eq!(result.leader, 1);

        assert_eq!(
            elect_preferred(
                &assignment,
                &leadership(1, vec![1, 2, 3]),
                &HashSet::from([1, 2, 3]),
            )
            .unwrap_err(),
            ElectionError::ElectionNotNeeded
        );

        assert_eq!(
            elect_preferred(
                &assignment,
                &leadership(2, vec![2, 3]),
                &HashSet::from([1, 2, 3]),
            )
            .unwrap_err(),
            ElectionError::PreferredLeaderNotAvailable(1)
        );
    }

    #[test]
    fn test_controlled_shutdown_election() {
        let assignment = ReplicaAssignment::new(vec![1, 2, 3]);
        let result = elect_for_controlled_shutdown(
            &assignment,
            &leadership(1, vec![1, 2, 3]),
            &HashSet::from([1, 2, 3]),
            &HashSet::from([1]),
        )
        .unwrap();
        assert_eq!(result.leader, 2);
        assert_eq!(result.isr, vec![2, 3]);
    }
}
