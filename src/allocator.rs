//! Partition allocation for consumer groups.
//!
//! An allocator is a pure function from sorted members and sorted partition
//! labels to an assignment. Every instance of a group runs the allocator
//! locally, so it has to be stable: equal inputs must produce equal outputs,
//! or members will disagree about who owns what.

use std::collections::BTreeMap;
use std::sync::Arc;

/// `member -> topic -> partition ids`, ordered so that equal assignments
/// compare and serialize identically.
pub type Assignment = BTreeMap<String, BTreeMap<String, Vec<i32>>>;

/// The allocator capability: `(sorted members, sorted "topic:partition"
/// labels) -> assignment`.
pub type AllocatorFn = Arc<dyn Fn(&[String], &[String]) -> Assignment + Send + Sync>;

/// Format a partition as the `"topic:partition"` label allocators consume.
pub fn partition_label(topic: &str, partition_id: i32) -> String {
    format!("{topic}:{partition_id}")
}

/// Split a `"topic:partition"` label.
pub(crate) fn parse_partition_label(label: &str) -> Option<(String, i32)> {
    let (topic, partition) = label.rsplit_once(':')?;
    Some((topic.to_owned(), partition.parse().ok()?))
}

/// The default allocator: cycle over members, handing each the next
/// partition, until no partitions are left.
///
/// Assumes roughly equal capacity per member and aims for even partition
/// counts; it does not try to keep partitions of one topic together.
pub fn naive_round_robin(members: &[String], partitions: &[String]) -> Assignment {
    let mut mapping = Assignment::new();

    if members.is_empty() {
        return mapping;
    }

    for (member, label) in members.iter().cycle().zip(partitions.iter()) {
        let Some((topic, partition_id)) = parse_partition_label(label) else {
            continue;
        };
        mapping
            .entry(member.clone())
            .or_default()
            .entry(topic)
            .or_default()
            .push(partition_id);
    }

    mapping
}

/// Check that `assignment` covers every input partition exactly once.
///
/// The engine treats allocators as black boxes; this is the only property it
/// enforces on their output.
pub(crate) fn validate_assignment(
    assignment: &Assignment,
    partitions: &[String],
) -> Result<(), String> {
    let mut seen = BTreeMap::new();
    for (member, topics) in assignment {
        for (topic, ids) in topics {
            for id in ids {
                let label = partition_label(topic, *id);
                if let Some(previous) = seen.insert(label.clone(), member.clone()) {
                    return Err(format!(
                        "partition {label} assigned to both {previous} and {member}"
                    ));
                }
            }
        }
    }

    for label in partitions {
        if !seen.contains_key(label) {
            return Err(format!("partition {label} not assigned to any member"));
        }
    }
    if seen.len() != partitions.len() {
        return Err(format!(
            "allocator assigned {} partitions but {} were offered",
            seen.len(),
            partitions.len()
        ));
    }

    Ok(())
}
