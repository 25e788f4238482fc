//! Turning a page of change-log entries into work
//!
//! Entries are folded in order. A thread that shows up as new is fetched
//! whole, so label changes recorded for it are dropped. For every other
//! thread the last change to a label wins: adding then removing `Work`
//! leaves a removal of `Work`, which is the mailbox's final state. Applying
//! it to a stored thread that never had the label changes nothing.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::types::HistoryRecord;

/// A thread with at least one added message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub thread_id: String,
    /// Last message added to the thread in this page
    pub message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub thread_id: String,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl LabelDelta {
    fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryChanges {
    /// In order of first appearance
    pub new_threads: Vec<NewThread>,
    pub label_deltas: Vec<LabelDelta>,
}

impl HistoryChanges {
    pub fn is_empty(&self) -> bool {
        self.new_threads.is_empty() && self.label_deltas.is_empty()
    }
}

pub fn partition_history(history: &[HistoryRecord]) -> HistoryChanges {
    let mut new_threads: Vec<NewThread> = Vec::new();
    let mut new_index: HashMap<String, usize> = HashMap::new();
    let mut deltas: Vec<LabelDelta> = Vec::new();
    let mut delta_index: HashMap<String, usize> = HashMap::new();

    for record in history {
        for added in &record.messages_added {
            match new_index.get(&added.thread_id) {
                Some(&i) => new_threads[i].message_id = added.message_id.clone(),
                None => {
                    new_index.insert(added.thread_id.clone(), new_threads.len());
                    new_threads.push(NewThread {
                        thread_id: added.thread_id.clone(),
                        message_id: added.message_id.clone(),
                    });
                }
            }
        }

        for change in &record.labels_added {
            let delta = delta_for(&mut deltas, &mut delta_index, &change.thread_id);
            for label in &change.label_ids {
                delta.removed.remove(label);
                delta.added.insert(label.clone());
            }
        }

        for change in &record.labels_removed {
            let delta = delta_for(&mut deltas, &mut delta_index, &change.thread_id);
            for label in &change.label_ids {
                delta.added.remove(label);
                delta.removed.insert(label.clone());
            }
        }
    }

    let fresh: HashSet<&str> = new_threads.iter().map(|t| t.thread_id.as_str()).collect();
    deltas.retain(|d| !d.is_empty() && !fresh.contains(d.thread_id.as_str()));

    HistoryChanges {
        new_threads,
        label_deltas: deltas,
    }
}

fn delta_for<'a>(
    deltas: &'a mut Vec<LabelDelta>,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
) -> &'a mut LabelDelta {
    let i = *index.entry(thread_id.to_string()).or_insert_with(|| {
        deltas.push(LabelDelta::new(thread_id));
        deltas.len() - 1
    });
    &mut deltas[i]
}

/// Compare two history ids. Numeric ids compare numerically; anything else
/// only counts as newer when it differs.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => candidate != current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mail::{HistoryLabelChange, HistoryMessage};

    fn added(id: &str, thread: &str, message: &str) -> HistoryRecord {
        HistoryRecord {
            id: id.into(),
            messages_added: vec![HistoryMessage {
                message_id: message.into(),
                thread_id: thread.into(),
                label_ids: vec!["INBOX".into()],
            }],
            ..Default::default()
        }
    }

    fn labels(id: &str, thread: &str, add: &[&str], remove: &[&str]) -> HistoryRecord {
        let change = |ls: &[&str]| HistoryLabelChange {
            message_id: format!("{}-m", thread),
            thread_id: thread.into(),
            label_ids: ls.iter().map(|l| l.to_string()).collect(),
        };
        HistoryRecord {
            id: id.into(),
            messages_added: Vec::new(),
            labels_added: vec![change(add)],
            labels_removed: vec![change(remove)],
        }
    }

    #[test]
    fn test_new_threads_deduplicated_in_order() {
        let changes = partition_history(&[
            added("1", "t1", "m1"),
            added("2", "t2", "m2"),
            added("3", "t1", "m3"),
        ]);
        assert_eq!(
            changes.new_threads,
            vec![
                NewThread {
                    thread_id: "t1".into(),
                    message_id: "m3".into()
                },
                NewThread {
                    thread_id: "t2".into(),
                    message_id: "m2".into()
                },
            ]
        );
    }

    #[test]
    fn test_label_changes_netted_per_thread() {
        let changes = partition_history(&[
            labels("1", "t1", &["Work", "Urgent"], &[]),
            labels("2", "t1", &[], &["Urgent", "INBOX"]),
            labels("3", "t1", &["Work"], &[]),
        ]);
        assert_eq!(changes.label_deltas.len(), 1);
        let delta = &changes.label_deltas[0];
        assert_eq!(delta.added, BTreeSet::from(["Work".to_string()]));
        assert_eq!(
            delta.removed,
            BTreeSet::from(["INBOX".to_string(), "Urgent".to_string()])
        );
    }

    #[test]
    fn test_last_change_to_a_label_wins() {
        let changes = partition_history(&[
            labels("1", "t1", &["Work"], &[]),
            labels("2", "t1", &[], &["Work"]),
            labels("3", "t2", &[], &["Later"]),
            labels("4", "t2", &["Later"], &[]),
        ]);
        assert_eq!(changes.label_deltas.len(), 2);

        let t1 = &changes.label_deltas[0];
        assert!(t1.added.is_empty());
        assert!(t1.removed.contains("Work"));

        let t2 = &changes.label_deltas[1];
        assert!(t2.added.contains("Later"));
        assert!(t2.removed.is_empty());
    }

    #[test]
    fn test_label_changes_of_new_threads_skipped() {
        let changes = partition_history(&[
            added("1", "t1", "m1"),
            labels("2", "t1", &["Work"], &[]),
            labels("3", "t2", &["Work"], &[]),
        ]);
        assert_eq!(changes.new_threads.len(), 1);
        assert_eq!(changes.label_deltas.len(), 1);
        assert_eq!(changes.label_deltas[0].thread_id, "t2");
    }

    #[test]
    fn test_history_id_ordering() {
        assert!(is_newer("120", "99"));
        assert!(!is_newer("99", "120"));
        assert!(!is_newer("120", "120"));
        assert!(is_newer("abc", "abd"));
    }
}
