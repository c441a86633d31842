use std::collections::{HashMap, HashSet};

use crate::key::TaskKey;

use super::Task;
use super::plan::PlanIndex;

/// One plan waiting on the keys of some incomplete dependencies.
#[derive(Debug)]
struct TaskBlockage {
    blocked: PlanIndex,
    blocking: HashSet<TaskKey>,
}

/// Tracks which plans are blocked by which incomplete task keys.
#[derive(Debug, Default)]
pub struct BlockageTracker {
    blockages: Vec<TaskBlockage>,
    by_blocking_key: HashMap<TaskKey, Vec<usize>>,
}

impl BlockageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `blocked` waits until every key of every task in
    /// `blocking` is complete.
    pub fn add_blockage<'a>(
        &mut self,
        blocked: PlanIndex,
        blocking: impl IntoIterator<Item = &'a Task>,
    ) {
        let keys: HashSet<TaskKey> = blocking
            .into_iter()
            .flat_map(|task| task.keys.iter().cloned())
            .collect();

        let id = self.blockages.len();
        for key in &keys {
            self.by_blocking_key.entry(key.clone()).or_default().push(id);
        }

        self.blockages.push(TaskBlockage {
            blocked,
            blocking: keys,
        });
    }

    /// Marks every key of `completed` as done and returns the plans that just
    /// became unblocked. A plan is returned at most once per blockage.
    pub fn get_unblocked_by(&mut self, completed: &Task) -> Vec<PlanIndex> {
        let mut unblocked = Vec::new();

        for key in &completed.keys {
            let Some(ids) = self.by_blocking_key.remove(key) else {
                continue;
            };

            for id in ids {
                let blockage = &mut self.blockages[id];
                if blockage.blocking.remove(key) && blockage.blocking.is_empty() {
                    unblocked.push(blockage.blocked);
                }
            }
        }

        unblocked
    }

    /// Plans which are still waiting on something.
    pub fn blocked_plans(&self) -> Vec<PlanIndex> {
        self.blockages
            .iter()
            .filter(|blockage| !blockage.blocking.is_empty())
            .map(|blockage| blockage.blocked)
            .collect()
    }
}
