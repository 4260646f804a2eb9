use std::collections::{BTreeMap, BTreeSet};

use crate::types::Partition;

/// member id -> subscribed topics
pub type Subscriptions = BTreeMap<String, BTreeSet<String>>;
/// member id -> assigned partitions
pub type Assignment = BTreeMap<String, BTreeSet<Partition>>;

/// Deterministic partition assignment. Members are ordered by id and
/// partitions by (topic, index), so the same inputs always give the same
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    /// Deal the sorted partition list out to members in turn, skipping members
    /// not subscribed to a partition's topic.
    #[default]
    RoundRobin,
    /// Per topic, split the partitions into contiguous ranges, one per
    /// subscribed member; the first members get one extra when it does not
    /// divide evenly.
    Range,
}

impl AssignmentStrategy {
    pub fn assign(
        &self,
        subscriptions: &Subscriptions,
        topic_partitions: &BTreeMap<String, i32>,
    ) -> Assignment {
        let mut assignment: Assignment = subscriptions
            .keys()
            .map(|member| (member.clone(), BTreeSet::new()))
            .collect();

        match self {
            AssignmentStrategy::RoundRobin => {
                let members: Vec<&String> = subscriptions.keys().collect();
                if members.is_empty() {
                    return assignment;
                }
                let mut cursor = 0;

                for (topic, count) in topic_partitions {
                    if !subscriptions.values().any(|topics| topics.contains(topic)) {
                        continue;
                    }
                    for index in 0..*count {
                        // at least one member is subscribed, so this terminates
                        while !subscriptions[members[cursor % members.len()]].contains(topic) {
                            cursor += 1;
                        }
                        let member = members[cursor % members.len()];
                        if let Some(owned) = assignment.get_mut(member) {
                            owned.insert(Partition::new(topic.clone(), index));
                        }
                        cursor += 1;
                    }
                }
            }
            AssignmentStrategy::Range => {
                for (topic, count) in topic_partitions {
                    let members: Vec<&String> = subscriptions
                        .iter()
                        .filter(|(_, topics)| topics.contains(topic))
                        .map(|(member, _)| member)
                        .collect();
                    if members.is_empty() {
                        continue;
                    }

                    let per_member = *count as usize / members.len();
                    let extra = *count as usize % members.len();
                    let mut next = 0;
                    for (i, member) in members.into_iter().enumerate() {
                        let take = per_member + usize::from(i < extra);
                        if let Some(owned) = assignment.get_mut(member) {
                            owned.extend(
                                (next..next + take).map(|p| Partition::new(topic.clone(), p as i32)),
                            );
                        }
                        next += take;
                    }
                }
            }
        }

        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs(entries: &[(&str, &[&str])]) -> Subscriptions {
        entries
            .iter()
            .map(|(member, topics)| {
                (
                    member.to_string(),
                    topics.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect()
    }

    fn topics(entries: &[(&str, i32)]) -> BTreeMap<String, i32> {
        entries.iter().map(|(t, n)| (t.to_string(), *n)).collect()
    }

    fn numbers(assignment: &Assignment, member: &str) -> Vec<(String, i32)> {
        assignment[member]
            .iter()
            .map(|p| (p.topic().to_string(), p.partition_number()))
            .collect()
    }

    #[test]
    fn test_round_robin_deals_sorted_partitions() {
        let assignment = AssignmentStrategy::RoundRobin.assign(
            &subs(&[("b", &["users"]), ("a", &["users"])]),
            &topics(&[("users", 5)]),
        );

        let a: Vec<i32> = assignment["a"].iter().map(|p| p.partition_number()).collect();
        let b: Vec<i32> = assignment["b"].iter().map(|p| p.partition_number()).collect();
        assert_eq!(a, vec![0, 2, 4]);
        assert_eq!(b, vec![1, 3]);
    }

    #[test]
    fn test_round_robin_skips_unsubscribed_members() {
        let assignment = AssignmentStrategy::RoundRobin.assign(
            &subs(&[("a", &["users"]), ("b", &["PAGEVIEWS_FEMALE"]), ("c", &["users"])]),
            &topics(&[("PAGEVIEWS_FEMALE", 1), ("users", 2)]),
        );

        assert_eq!(numbers(&assignment, "b"), vec![("PAGEVIEWS_FEMALE".to_string(), 0)]);
        assert_eq!(assignment["a"].len() + assignment["c"].len(), 2);
        assert!(assignment["a"].iter().all(|p| p.topic() == "users"));
        assert!(assignment["c"].iter().all(|p| p.topic() == "users"));
    }

    #[test]
    fn test_range_gives_contiguous_blocks() {
        let assignment = AssignmentStrategy::Range.assign(
            &subs(&[("a", &["users"]), ("b", &["users"]), ("c", &["users"])]),
            &topics(&[("users", 7)]),
        );

        let nums = |m: &str| -> Vec<i32> {
            assignment[m].iter().map(|p| p.partition_number()).collect()
        };
        assert_eq!(nums("a"), vec![0, 1, 2]);
        assert_eq!(nums("b"), vec![3, 4]);
        assert_eq!(nums("c"), vec![5, 6]);
    }

    #[test]
    fn test_every_partition_assigned_exactly_once() {
        let subscriptions = subs(&[("m1", &["t1", "t2"]), ("m2", &["t2"]), ("m3", &["t1"])]);
        let topic_partitions = topics(&[("t1", 4), ("t2", 3), ("unsubscribed", 2)]);

        for strategy in [AssignmentStrategy::RoundRobin, AssignmentStrategy::Range] {
            let assignment = strategy.assign(&subscriptions, &topic_partitions);
            let mut all: Vec<&Partition> = assignment.values().flatten().collect();
            let total = all.len();
            all.sort();
            all.dedup();
            assert_eq!(total, 7, "{strategy:?}");
            assert_eq!(all.len(), 7, "{strategy:?}");
        }
    }

    #[test]
    fn test_more_members_than_partitions() {
        let assignment = AssignmentStrategy::Range.assign(
            &subs(&[("a", &["users"]), ("b", &["users"])]),
            &topics(&[("users", 1)]),
        );
        assert_eq!(assignment["a"].len(), 1);
        assert!(assignment["b"].is_empty());
    }
}
