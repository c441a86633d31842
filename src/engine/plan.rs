//! The static task graph of a flow.
//!
//! Building happens in two passes, both on an explicit stack so that very
//! deep graphs do not exhaust the native one:
//!
//! 1. every descriptor node is resolved, dependencies first, into its key
//!    space and the keys of its tasks;
//! 2. every task key is bound to a [`TaskPlan`] holding its task, the plans of
//!    its dependencies, its provider and its case key.
//!
//! Plans live in an arena and refer to each other by [`PlanIndex`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheAccessor, EntityResult};
use crate::core::Hash32;
use crate::error::DeriveError;
use crate::key::{CaseKey, DescriptorNode, KeySpace, TaskKey};

use super::provenance::Provenance;
use super::{FlowState, Provider, Task, validate_provider};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanIndex(usize);

impl PlanIndex {
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: usize) -> Self {
        Self(index)
    }
}

/// State attached to a plan once its provenance is known and its values are
/// either computed or known to be in the cache.
pub(crate) struct Completion {
    pub provenance: Provenance,
    /// Present iff the provider persists.
    pub accessors: Option<Vec<Box<dyn CacheAccessor>>>,
    /// Present iff the provider persists.
    pub value_hashes: Option<Vec<Hash32>>,
    pub memoized: Option<Vec<EntityResult>>,
}

pub(crate) enum PlanState {
    Incomplete,
    Complete(Completion),
}

pub struct TaskPlan {
    pub task: Arc<Task>,
    pub dep_plans: Vec<PlanIndex>,
    pub case_key: CaseKey,
    pub provider: Arc<dyn Provider>,
    pub(crate) state: PlanState,
}

impl TaskPlan {
    pub fn is_complete(&self) -> bool {
        matches!(self.state, PlanState::Complete(_))
    }

    pub(crate) fn completion(&self) -> Option<&Completion> {
        match &self.state {
            PlanState::Complete(completion) => Some(completion),
            PlanState::Incomplete => None,
        }
    }

    /// # Panics
    /// If the plan is not complete. The scheduler only asks for completions of
    /// plans it has completed.
    pub(crate) fn expect_completion(&self) -> &Completion {
        match &self.state {
            PlanState::Complete(completion) => completion,
            PlanState::Incomplete => panic!("plan for {:?} is not complete", self.task.keys),
        }
    }

    /// Provenance of the plan's outputs, once complete.
    pub fn provenance(&self) -> Option<&Provenance> {
        self.completion().map(|completion| &completion.provenance)
    }
}

pub struct FlowPlan {
    state: FlowState,
    providers: HashMap<DescriptorNode, Arc<dyn Provider>>,
    key_spaces: HashMap<DescriptorNode, KeySpace>,
    /// Keys of each node's tasks, in the order its provider returned them.
    keys_by_dnode: HashMap<DescriptorNode, Vec<TaskKey>>,
    docs: HashMap<DescriptorNode, Option<String>>,
    tasks_by_key: HashMap<TaskKey, Arc<Task>>,
    plans: Vec<TaskPlan>,
    plans_by_key: HashMap<TaskKey, PlanIndex>,
    is_set_up: bool,
}

enum NodeFrame {
    Enter(DescriptorNode),
    Exit(DescriptorNode, Arc<dyn Provider>),
}

enum KeyFrame {
    Enter(TaskKey),
    Exit(TaskKey),
}

impl FlowPlan {
    pub fn new(state: FlowState) -> Self {
        Self {
            state,
            providers: HashMap::new(),
            key_spaces: HashMap::new(),
            keys_by_dnode: HashMap::new(),
            docs: HashMap::new(),
            tasks_by_key: HashMap::new(),
            plans: Vec::new(),
            plans_by_key: HashMap::new(),
            is_set_up: false,
        }
    }

    /// Resolves every defined entity. Calling this more than once is a no-op.
    pub fn set_up(&mut self) -> Result<(), DeriveError> {
        if self.is_set_up {
            return Ok(());
        }

        let mut dnodes: Vec<DescriptorNode> = self.state.dnodes().cloned().collect();
        dnodes.sort();

        for dnode in &dnodes {
            self.resolve(dnode)?;
        }

        debug!(plans = self.plans.len(), "flow plan set up");
        self.is_set_up = true;
        Ok(())
    }

    /// Makes sure `dnode` and everything it depends on has task plans.
    pub fn resolve(&mut self, dnode: &DescriptorNode) -> Result<(), DeriveError> {
        self.populate_dnode(dnode)?;

        let keys = self.keys_by_dnode.get(dnode).cloned().unwrap_or_default();
        for key in &keys {
            self.plan_for_key_or_create(key)?;
        }

        Ok(())
    }

    pub fn keys_for_dnode(&self, dnode: &DescriptorNode) -> Option<&[TaskKey]> {
        self.keys_by_dnode.get(dnode).map(Vec::as_slice)
    }

    pub fn key_space_for_dnode(&self, dnode: &DescriptorNode) -> Option<&KeySpace> {
        self.key_spaces.get(dnode)
    }

    pub fn doc_for_dnode(&self, dnode: &DescriptorNode) -> Option<&str> {
        self.docs.get(dnode).and_then(|doc| doc.as_deref())
    }

    pub fn all_dnodes(&self) -> impl Iterator<Item = &DescriptorNode> {
        self.keys_by_dnode.keys()
    }

    pub fn plan_for_key(&self, key: &TaskKey) -> Option<PlanIndex> {
        self.plans_by_key.get(key).copied()
    }

    pub fn plan(&self, index: PlanIndex) -> &TaskPlan {
        &self.plans[index.0]
    }

    pub(crate) fn plan_mut(&mut self, index: PlanIndex) -> &mut TaskPlan {
        &mut self.plans[index.0]
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Dependencies of a plan which are not complete yet, each listed once.
    pub fn incomplete_dep_plans(&self, index: PlanIndex) -> Vec<PlanIndex> {
        let mut seen = HashSet::new();

        self.plan(index)
            .dep_plans
            .iter()
            .copied()
            .filter(|&dep| !self.plan(dep).is_complete() && seen.insert(dep))
            .collect()
    }

    pub fn is_blocked(&self, index: PlanIndex) -> bool {
        self.plan(index)
            .dep_plans
            .iter()
            .any(|&dep| !self.plan(dep).is_complete())
    }

    fn populate_dnode(&mut self, root: &DescriptorNode) -> Result<(), DeriveError> {
        let mut stack = vec![NodeFrame::Enter(root.clone())];
        let mut in_progress = HashSet::new();

        while let Some(frame) = stack.pop() {
            match frame {
                NodeFrame::Enter(dnode) => {
                    if self.keys_by_dnode.contains_key(&dnode) {
                        continue;
                    }

                    // Everything above an unfinished node on the stack
                    // descends from it, so meeting it again means a cycle.
                    if in_progress.contains(&dnode) {
                        return Err(DeriveError::DependencyCycle(dnode.to_string()));
                    }

                    let provider = self
                        .state
                        .get_provider(&dnode)
                        .ok_or_else(|| DeriveError::UndefinedEntity(dnode.to_string()))?;
                    validate_provider(&dnode, provider.as_ref())?;

                    let deps = provider.get_dependency_dnodes();
                    in_progress.insert(dnode.clone());
                    stack.push(NodeFrame::Exit(dnode, provider));
                    stack.extend(deps.into_iter().rev().map(NodeFrame::Enter));
                }
                NodeFrame::Exit(dnode, provider) => {
                    self.finish_dnode(&dnode, provider)?;
                    in_progress.remove(&dnode);
                }
            }
        }

        Ok(())
    }

    fn finish_dnode(
        &mut self,
        dnode: &DescriptorNode,
        provider: Arc<dyn Provider>,
    ) -> Result<(), DeriveError> {
        let deps = provider.get_dependency_dnodes();

        let mut dep_key_spaces = HashMap::new();
        let mut dep_task_key_lists = HashMap::new();
        for dep in deps {
            if let Some(space) = self.key_spaces.get(&dep) {
                dep_key_spaces.insert(dep.clone(), space.clone());
            }
            if let Some(keys) = self.keys_by_dnode.get(&dep) {
                dep_task_key_lists.insert(dep, keys.clone());
            }
        }

        let key_space = provider.get_key_space(&dep_key_spaces);
        let tasks = provider
            .get_tasks(&dep_key_spaces, &dep_task_key_lists)
            .map_err(|source| DeriveError::Provider {
                entity: dnode.to_string(),
                source,
            })?;

        let mut keys = Vec::with_capacity(tasks.len());
        for task in tasks {
            let key = task
                .key_for_dnode(dnode)
                .cloned()
                .ok_or_else(|| DeriveError::InconsistentTask {
                    task: dnode.to_string(),
                    reason: "a task does not produce the entity it was returned for",
                })?;

            let task = Arc::new(task);
            for task_key in &task.keys {
                self.tasks_by_key
                    .entry(task_key.clone())
                    .or_insert_with(|| task.clone());
            }
            keys.push(key);
        }

        self.docs.insert(dnode.clone(), provider.doc_for(dnode));
        self.key_spaces.insert(dnode.clone(), key_space);
        self.keys_by_dnode.insert(dnode.clone(), keys);
        self.providers.insert(dnode.clone(), provider);
        Ok(())
    }

    fn plan_for_key_or_create(&mut self, root: &TaskKey) -> Result<PlanIndex, DeriveError> {
        let mut stack = vec![KeyFrame::Enter(root.clone())];
        let mut in_progress = HashSet::new();

        while let Some(frame) = stack.pop() {
            match frame {
                KeyFrame::Enter(key) => {
                    if self.plans_by_key.contains_key(&key) {
                        continue;
                    }
                    if in_progress.contains(&key) {
                        return Err(DeriveError::DependencyCycle(key.to_string()));
                    }

                    let task = self.task_for_key(&key)?;
                    in_progress.insert(key.clone());
                    stack.push(KeyFrame::Exit(key));
                    stack.extend(task.dep_keys.iter().rev().cloned().map(KeyFrame::Enter));
                }
                KeyFrame::Exit(key) => {
                    in_progress.remove(&key);
                    if !self.plans_by_key.contains_key(&key) {
                        self.create_plan(&key)?;
                    }
                }
            }
        }

        self.plan_for_key(root)
            .ok_or_else(|| DeriveError::UndefinedEntity(root.to_string()))
    }

    fn task_for_key(&self, key: &TaskKey) -> Result<Arc<Task>, DeriveError> {
        self.tasks_by_key
            .get(key)
            .cloned()
            .ok_or_else(|| DeriveError::InconsistentTask {
                task: key.to_string(),
                reason: "no task produces this key",
            })
    }

    fn create_plan(&mut self, key: &TaskKey) -> Result<(), DeriveError> {
        let task = self.task_for_key(key)?;
        let inconsistent = |reason| DeriveError::InconsistentTask {
            task: key.to_string(),
            reason,
        };

        let mut dep_plans = Vec::with_capacity(task.dep_keys.len());
        for dep_key in &task.dep_keys {
            let dep = self
                .plan_for_key(dep_key)
                .ok_or_else(|| inconsistent("a dependency has no plan"))?;
            dep_plans.push(dep);
        }

        let mut provider: Option<Arc<dyn Provider>> = None;
        let mut case_key: Option<&CaseKey> = None;
        for task_key in &task.keys {
            let found = self
                .providers
                .get(&task_key.dnode)
                .cloned()
                .or_else(|| self.state.get_provider(&task_key.dnode))
                .ok_or_else(|| DeriveError::UndefinedEntity(task_key.dnode.to_string()))?;

            match &provider {
                Some(existing) if !Arc::ptr_eq(existing, &found) => {
                    return Err(inconsistent("its keys belong to different providers"));
                }
                Some(_) => {}
                None => provider = Some(found),
            }

            match case_key {
                Some(existing) if existing != &task_key.case_key => {
                    return Err(inconsistent("its keys have different case keys"));
                }
                Some(_) => {}
                None => case_key = Some(&task_key.case_key),
            }
        }

        let (Some(provider), Some(case_key)) = (provider, case_key.cloned()) else {
            return Err(inconsistent("it produces no keys"));
        };

        let index = PlanIndex(self.plans.len());
        for task_key in &task.keys {
            self.plans_by_key.insert(task_key.clone(), index);
        }
        self.plans.push(TaskPlan {
            task,
            dep_plans,
            case_key,
            provider,
            state: PlanState::Incomplete,
        });

        Ok(())
    }
}
