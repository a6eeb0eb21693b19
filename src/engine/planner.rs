use std::collections::HashSet;

use super::identity::WorkItem;

/// Outcome of resume planning for one stage run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Items to attempt this run, in candidate order
    pub work: Vec<WorkItem>,

    /// Candidates already finished according to either witness
    pub already_done: usize,

    /// Pending candidates left for a later run by the per-run cap
    pub deferred: usize,

    /// Ids whose artifact exists but whose ledger has no terminal row
    pub backfill: Vec<String>,
}

/// Compute the work-set: candidates minus ledger-completed minus artifact-present.
///
/// Candidate order is preserved and duplicate ids collapse to their first
/// occurrence, so a cap always takes the earliest pending items and repeated
/// runs advance monotonically through the list.
pub fn plan(
    candidates: Vec<WorkItem>,
    completed: &HashSet<String>,
    existing_artifacts: &HashSet<String>,
    max_items: Option<usize>,
) -> Plan {
    let mut seen = HashSet::new();
    let mut result = Plan::default();

    for item in candidates {
        if !seen.insert(item.stable_id.clone()) {
            tracing::debug!("Duplicate candidate ignored: {}", item.raw_name);
            continue;
        }

        let in_ledger = completed.contains(&item.stable_id);
        let has_artifact = existing_artifacts.contains(&item.stable_id);

        if in_ledger || has_artifact {
            result.already_done += 1;
            if has_artifact && !in_ledger {
                result.backfill.push(item.stable_id);
            }
            continue;
        }

        result.work.push(item);
    }

    if let Some(cap) = max_items {
        if result.work.len() > cap {
            result.deferred = result.work.len() - cap;
            result.work.truncate(cap);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(names: &[&str]) -> Vec<WorkItem> {
        names.iter().map(|n| WorkItem::new(*n)).collect()
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.work.iter().map(|i| i.stable_id.as_str()).collect()
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_subtracts_both_witnesses() {
        let plan = plan(
            items(&["a.json", "b.json", "c.json", "d.json"]),
            &set(&["b"]),
            &set(&["c"]),
            None,
        );

        assert_eq!(ids(&plan), vec!["a", "d"]);
        assert_eq!(plan.already_done, 2);
        assert_eq!(plan.backfill, vec!["c".to_string()]);
    }

    #[test]
    fn test_both_witnesses_present_needs_no_backfill() {
        let plan = plan(items(&["a.json"]), &set(&["a"]), &set(&["a"]), None);
        assert!(plan.work.is_empty());
        assert!(plan.backfill.is_empty());
    }

    #[test]
    fn test_cap_truncates_in_candidate_order() {
        let plan = plan(items(&["a", "b", "c", "d"]), &HashSet::new(), &HashSet::new(), Some(2));
        assert_eq!(ids(&plan), vec!["a", "b"]);
        assert_eq!(plan.deferred, 2);
    }

    #[test]
    fn test_cap_applies_after_subtraction() {
        let plan = plan(items(&["a", "b", "c", "d"]), &set(&["a"]), &HashSet::new(), Some(2));
        assert_eq!(ids(&plan), vec!["b", "c"]);
    }

    #[test]
    fn test_duplicate_ids_collapse() {
        let plan = plan(items(&["a.mp4", "a.wav", "b.wav"]), &HashSet::new(), &HashSet::new(), None);
        assert_eq!(ids(&plan), vec!["a", "b"]);
        assert_eq!(plan.work[0].raw_name, "a.mp4");
    }
}
