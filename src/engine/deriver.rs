//! Drives task plans from requested to complete.
//!
//! Every derivation runs a worklist over plan indices. A popped plan whose
//! dependencies are all complete is completed: its provenance is computed, its
//! values are found in the persistent cache or computed, and any plans that
//! were waiting on it are pushed back. A plan with incomplete dependencies is
//! parked in the [`BlockageTracker`] and its dependencies are pushed instead.
//!
//! Before anything else can be derived, the persistent cache and versioning
//! policy are themselves derived, with persistence disabled.

use std::any::type_name;
use std::collections::HashSet;

use tracing::{Level, debug, debug_span, info_span};
use uuid::Uuid;

use crate::cache::{CacheAccessor, EntityResult, PersistentCache, Query, ResultGroup};
use crate::core::{Dynamic, Hash32};
use crate::error::DeriveError;
use crate::key::{DescriptorNode, TaskKey};
use crate::versioning::VersioningPolicy;

use super::blockage::BlockageTracker;
use super::dag::{DagNode, FlowDag};
use super::logger::{TaskKeyLogger, TaskLogRecord};
use super::plan::{Completion, FlowPlan, PlanIndex, PlanState};
use super::provenance::{Computation, Provenance, ProvenanceDigest};
use super::{EntityAttrs, FlowState, Task};

pub const PERSISTENT_CACHE: &str = "core__persistent_cache";
pub const VERSIONING_POLICY: &str = "core__versioning_policy";

/// Resolved values of the bootstrap entities.
#[derive(Clone, Debug)]
pub struct Bootstrap {
    pub persistent_cache: PersistentCache,
    pub versioning_policy: VersioningPolicy,
}

/// Derives the values of descriptors in one flow definition.
pub struct Deriver {
    plan: FlowPlan,
    flow_instance_id: Uuid,
    bootstrap: Option<Bootstrap>,
    journal: Vec<TaskLogRecord>,
}

impl Deriver {
    pub fn new(state: FlowState, flow_instance_id: Uuid) -> Self {
        Self {
            plan: FlowPlan::new(state),
            flow_instance_id,
            bootstrap: None,
            journal: Vec::new(),
        }
    }

    pub fn flow_instance_id(&self) -> Uuid {
        self.flow_instance_id
    }

    pub fn plan(&self) -> &FlowPlan {
        &self.plan
    }

    /// Builds the plan and resolves the bootstrap entities. Calling this is
    /// not necessary, but surfaces configuration errors early.
    pub fn get_ready(&mut self) -> Result<(), DeriveError> {
        if self.bootstrap.is_some() {
            return Ok(());
        }

        self.plan.set_up()?;

        let persistent_cache = self.bootstrap_singleton::<PersistentCache>(PERSISTENT_CACHE)?;
        let versioning_policy = self.bootstrap_singleton::<VersioningPolicy>(VERSIONING_POLICY)?;
        debug!(?versioning_policy, "bootstrap resolved");

        self.bootstrap = Some(Bootstrap {
            persistent_cache,
            versioning_policy,
        });

        Ok(())
    }

    /// Computes every value of `dnode`, one per case key.
    pub fn derive(&mut self, dnode: &DescriptorNode) -> Result<ResultGroup, DeriveError> {
        self.get_ready()?;

        let span = info_span!("derive", %dnode);
        let _enter = span.enter();

        self.execution().derive_result_group(dnode)
    }

    /// Exports the task graph, one node per task key. Internal `core__`
    /// entities are left out unless `include_core` is set.
    pub fn export_dag(&mut self, include_core: bool) -> Result<FlowDag, DeriveError> {
        self.get_ready()?;

        let mut dnodes: Vec<&DescriptorNode> = self
            .plan
            .all_dnodes()
            .filter(|dnode| include_core || !dnode.is_internal())
            .collect();
        dnodes.sort();

        let mut dag = FlowDag::default();
        let mut edges = Vec::new();

        for dnode in dnodes {
            let Some(keys) = self.plan.keys_for_dnode(dnode) else {
                continue;
            };

            let mut keys = keys.to_vec();
            keys.sort_by(|a, b| a.case_key.cmp(&b.case_key));

            let entity_name = dnode.to_string();
            let doc = self.plan.doc_for_dnode(dnode).map(str::to_string);
            let single = keys.len() == 1;

            for (task_ix, key) in keys.into_iter().enumerate() {
                let name = if single {
                    entity_name.clone()
                } else {
                    format!("{entity_name}[{task_ix}]")
                };

                if let Some(index) = self.plan.plan_for_key(&key) {
                    for &dep in &self.plan.plan(index).dep_plans {
                        for dep_key in &self.plan.plan(dep).task.keys {
                            edges.push((dep_key.clone(), key.clone()));
                        }
                    }
                }

                dag.add_node(DagNode {
                    case_key: key.case_key.clone(),
                    task_key: key,
                    name,
                    entity_name: entity_name.clone(),
                    task_ix,
                    doc: doc.clone(),
                });
            }
        }

        for (from, to) in &edges {
            dag.add_edge(from, to);
        }

        Ok(dag)
    }

    /// Drains the record of how each task key was obtained.
    pub fn take_log(&mut self) -> Vec<TaskLogRecord> {
        std::mem::take(&mut self.journal)
    }

    fn execution(&mut self) -> FlowExecution<'_> {
        FlowExecution::new(
            &mut self.plan,
            self.flow_instance_id,
            self.bootstrap.as_ref(),
            &mut self.journal,
        )
    }

    fn bootstrap_singleton<T>(&mut self, name: &str) -> Result<T, DeriveError>
    where
        T: Clone + 'static,
    {
        let span = debug_span!("bootstrap", entity = name);
        let _enter = span.enter();

        let dnode = DescriptorNode::entity(name);
        let group = match self.execution().derive_result_group(&dnode) {
            Err(DeriveError::UndefinedEntity(missing)) if missing == name => {
                return Err(DeriveError::BootstrapUndefined(name.to_string()));
            }
            result => result?,
        };

        match group.len() {
            0 => Err(DeriveError::BootstrapUndefined(name.to_string())),
            1 => group[0]
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| DeriveError::BootstrapType {
                    entity: name.to_string(),
                    expected: type_name::<T>(),
                }),
            count => Err(DeriveError::BootstrapMultiple {
                entity: name.to_string(),
                count,
            }),
        }
    }
}

/// State of a single derivation.
struct FlowExecution<'a> {
    plan: &'a mut FlowPlan,
    flow_instance_id: Uuid,
    bootstrap: Option<&'a Bootstrap>,
    logger: TaskKeyLogger<'a>,
    blockages: BlockageTracker,
}

impl<'a> FlowExecution<'a> {
    fn new(
        plan: &'a mut FlowPlan,
        flow_instance_id: Uuid,
        bootstrap: Option<&'a Bootstrap>,
        journal: &'a mut Vec<TaskLogRecord>,
    ) -> Self {
        let level = match bootstrap {
            Some(_) => Level::INFO,
            None => Level::DEBUG,
        };

        Self {
            plan,
            flow_instance_id,
            bootstrap,
            logger: TaskKeyLogger::new(level, journal),
            blockages: BlockageTracker::new(),
        }
    }

    fn derive_result_group(&mut self, dnode: &DescriptorNode) -> Result<ResultGroup, DeriveError> {
        self.plan.resolve(dnode)?;

        let keys = self
            .plan
            .keys_for_dnode(dnode)
            .ok_or_else(|| DeriveError::UndefinedEntity(dnode.to_string()))?
            .to_vec();

        let mut requested = Vec::with_capacity(keys.len());
        for key in keys {
            let index = self
                .plan
                .plan_for_key(&key)
                .ok_or_else(|| DeriveError::UndefinedEntity(key.to_string()))?;
            requested.push((index, key));
        }

        self.run_worklist(requested.iter().map(|(index, _)| *index))?;

        let mut results = Vec::with_capacity(requested.len());
        for (index, key) in &requested {
            let position = position_of(self.plan.plan(*index).task.as_ref(), key);
            let mut plan_results = self.results_for_complete_plan(*index)?;
            results.push(plan_results.swap_remove(position));
        }

        let key_space = self
            .plan
            .key_space_for_dnode(dnode)
            .cloned()
            .unwrap_or_default();

        Ok(ResultGroup { results, key_space })
    }

    fn run_worklist(&mut self, seeds: impl Iterator<Item = PlanIndex>) -> Result<(), DeriveError> {
        let mut ready: Vec<PlanIndex> = Vec::new();
        // Plans either waiting on the stack or parked as blocked. Neither
        // needs pushing again: the blocked ones come back once unblocked.
        let mut scheduled: HashSet<PlanIndex> = HashSet::new();

        for seed in seeds {
            if scheduled.insert(seed) {
                ready.push(seed);
            }
        }

        while let Some(index) = ready.pop() {
            let plan = self.plan.plan(index);

            if plan.is_complete() {
                scheduled.remove(&index);
                for key in &plan.task.keys {
                    self.logger.accessed_from_memory(key);
                }
                continue;
            }

            let incomplete = self.plan.incomplete_dep_plans(index);
            if !incomplete.is_empty() {
                let blocking: Vec<&Task> = incomplete
                    .iter()
                    .map(|&dep| self.plan.plan(dep).task.as_ref())
                    .collect();
                self.blockages.add_blockage(index, blocking);

                for dep in incomplete {
                    if scheduled.insert(dep) {
                        ready.push(dep);
                    }
                }
                continue;
            }

            self.complete_task_plan(index)?;
            scheduled.remove(&index);

            let task = self.plan.plan(index).task.clone();
            ready.extend(self.blockages.get_unblocked_by(&task));
        }

        let blocked = self.blockages.blocked_plans();
        assert!(
            blocked.is_empty(),
            "derivation finished with blocked plans: {blocked:?}"
        );

        Ok(())
    }

    fn complete_task_plan(&mut self, index: PlanIndex) -> Result<(), DeriveError> {
        let plan = self.plan.plan(index);
        assert!(!plan.is_complete(), "plan {index:?} completed twice");
        assert!(!self.plan.is_blocked(index), "plan {index:?} is still blocked");

        let task = plan.task.clone();
        let provider = plan.provider.clone();
        let case_key = plan.case_key.clone();
        let dep_plans = plan.dep_plans.clone();
        let attrs = provider.attrs();

        let treat_bytecode_as_functional = self
            .bootstrap
            .is_some_and(|bootstrap| bootstrap.versioning_policy.treat_bytecode_as_functional);

        let mut dep_digests = Vec::with_capacity(task.dep_keys.len());
        for (dep_key, &dep_index) in task.dep_keys.iter().zip(&dep_plans) {
            let dep = self.plan.plan(dep_index);
            let completion = dep.expect_completion();

            let digest = match &completion.value_hashes {
                Some(hashes) if dep.provider.attrs().persist => {
                    ProvenanceDigest::from_value_hash(hashes[position_of(&dep.task, dep_key)])
                }
                _ => ProvenanceDigest::from_provenance(&completion.provenance),
            };
            dep_digests.push(digest);
        }

        let code_fingerprint = provider.get_code_fingerprint(&case_key);
        let provenance = Provenance::from_computation(Computation {
            code_fingerprint: &code_fingerprint,
            case_key: &case_key,
            dep_digests: &dep_digests,
            treat_bytecode_as_functional,
            can_functionally_change_per_run: attrs.changes_per_run,
            flow_instance_id: self.flow_instance_id,
        });

        let queries: Vec<Query> = task
            .keys
            .iter()
            .map(|key| Query {
                task_key: key.clone(),
                protocol: provider.protocol_for(&key.dnode),
                provenance: provenance.clone(),
            })
            .collect();

        let accessors = if attrs.persist {
            let Some(bootstrap) = self.bootstrap else {
                return Err(DeriveError::PrematurePersistence(
                    task.keys[0].dnode.to_string(),
                ));
            };

            let accessors: Vec<Box<dyn CacheAccessor>> = queries
                .iter()
                .map(|query| bootstrap.persistent_cache.get_accessor(query.clone()))
                .collect();

            if bootstrap.versioning_policy.check_for_bytecode_errors {
                check_accessors_for_version_problems(&accessors)?;
            }

            Some(accessors)
        } else {
            None
        };

        let cached_hashes = match &accessors {
            Some(accessors) => load_value_hashes_if_cached(accessors)?,
            None => None,
        };

        let (value_hashes, memoized) = match cached_hashes {
            Some(hashes) => (Some(hashes), None),
            None => self.compute_task_plan(&task, &dep_plans, &queries, accessors.as_deref(), attrs)?,
        };

        self.plan.plan_mut(index).state = PlanState::Complete(Completion {
            provenance,
            accessors,
            value_hashes,
            memoized,
        });

        Ok(())
    }

    fn compute_task_plan(
        &mut self,
        task: &Task,
        dep_plans: &[PlanIndex],
        queries: &[Query],
        accessors: Option<&[Box<dyn CacheAccessor>]>,
        attrs: &EntityAttrs,
    ) -> Result<(Option<Vec<Hash32>>, Option<Vec<EntityResult>>), DeriveError> {
        let mut dep_values: Vec<Dynamic> = Vec::with_capacity(task.dep_keys.len());
        for (dep_key, &dep_index) in task.dep_keys.iter().zip(dep_plans) {
            let position = position_of(&self.plan.plan(dep_index).task, dep_key);
            let mut results = self.results_for_complete_plan(dep_index)?;
            dep_values.push(results.swap_remove(position).value);
        }

        if !task.is_simple_lookup {
            for key in &task.keys {
                self.logger.computing(key);
            }
        }

        let values = {
            let span = debug_span!("task", key = %task.keys[0]);
            let _enter = span.enter();

            task.compute(&dep_values)
                .map_err(|source| DeriveError::Task {
                    task: task.keys[0].to_string(),
                    source,
                })?
        };

        if values.len() != task.keys.len() {
            return Err(DeriveError::TaskArity {
                task: task.keys[0].to_string(),
                expected: task.keys.len(),
                actual: values.len(),
            });
        }

        for query in queries {
            if task.is_simple_lookup {
                self.logger.accessed_from_definition(&query.task_key);
            } else {
                self.logger.computed(&query.task_key);
            }
        }

        let mut results = Vec::with_capacity(values.len());
        let mut value_hashes = Vec::with_capacity(values.len());

        for (ix, (query, value)) in queries.iter().zip(values).enumerate() {
            query
                .protocol
                .validate(&value)
                .map_err(|source| DeriveError::Protocol {
                    task: query.task_key.to_string(),
                    source,
                })?;

            let result = EntityResult {
                query: query.clone(),
                value,
            };

            if let Some(accessors) = accessors {
                let accessor = &accessors[ix];
                accessor
                    .save_result(&result)
                    .map_err(cache_error(&query.task_key))?;
                value_hashes.push(
                    accessor
                        .load_result_value_hash()
                        .map_err(cache_error(&query.task_key))?,
                );
            }

            results.push(result);
        }

        // Persisted values are memoized only once loaded back, so callers
        // always see the deserialized value.
        let memoized = (attrs.memoize && !attrs.persist).then_some(results);
        let value_hashes = attrs.persist.then_some(value_hashes);

        Ok((value_hashes, memoized))
    }

    fn results_for_complete_plan(&mut self, index: PlanIndex) -> Result<Vec<EntityResult>, DeriveError> {
        let plan = self.plan.plan(index);
        let completion = plan.expect_completion();

        if let Some(memoized) = &completion.memoized {
            for key in &plan.task.keys {
                self.logger.accessed_from_memory(key);
            }
            return Ok(memoized.clone());
        }

        let Some(accessors) = &completion.accessors else {
            return Err(DeriveError::ResultsUnavailable(plan.task.keys[0].to_string()));
        };

        let mut results = Vec::with_capacity(accessors.len());
        for accessor in accessors {
            let task_key = &accessor.query().task_key;
            let result = accessor.load_result().map_err(cache_error(task_key))?;
            self.logger.loaded_from_disk(task_key);

            // Keep the stored entry pointing at this exact query.
            accessor.save_result(&result).map_err(cache_error(task_key))?;
            results.push(result);
        }

        if plan.provider.attrs().memoize
            && let PlanState::Complete(completion) = &mut self.plan.plan_mut(index).state
        {
            completion.memoized = Some(results.clone());
        }

        Ok(results)
    }
}

/// # Panics
/// If `key` is not one of the task's keys; plans are only ever built from
/// tasks producing the keys they are registered under.
fn position_of(task: &Task, key: &TaskKey) -> usize {
    match task.position_of(key) {
        Some(position) => position,
        None => panic!("task {:?} does not produce {key}", task.keys),
    }
}

fn cache_error(task_key: &TaskKey) -> impl Fn(anyhow::Error) -> DeriveError + '_ {
    move |source| DeriveError::Cache {
        task: task_key.to_string(),
        source,
    }
}

/// Returns the stored value hashes if every value is in the cache.
fn load_value_hashes_if_cached(
    accessors: &[Box<dyn CacheAccessor>],
) -> Result<Option<Vec<Hash32>>, DeriveError> {
    for accessor in accessors {
        let task_key = &accessor.query().task_key;
        if !accessor.can_load().map_err(cache_error(task_key))? {
            return Ok(None);
        }
    }

    let mut hashes = Vec::with_capacity(accessors.len());
    for accessor in accessors {
        let task_key = &accessor.query().task_key;
        hashes.push(
            accessor
                .load_result_value_hash()
                .map_err(cache_error(task_key))?,
        );
    }

    Ok(Some(hashes))
}

/// Fails if a stored value carries the same declared version as the current
/// code but was produced by different code. Otherwise, stored provenance is
/// brought up to date with the current one.
fn check_accessors_for_version_problems(
    accessors: &[Box<dyn CacheAccessor>],
) -> Result<(), DeriveError> {
    let mut needing_update = Vec::new();

    for accessor in accessors {
        let query = accessor.query();
        let old = accessor
            .load_provenance()
            .map_err(cache_error(&query.task_key))?;

        let Some(old) = old else {
            continue;
        };

        let new = &query.provenance;
        if old.exactly_matches(new) {
            continue;
        }

        if new.is_unversioned_change_from(&old) {
            return Err(DeriveError::CodeVersioning {
                descriptor: query.task_key.dnode.to_string(),
                major: old.code_version_major,
                minor: old.code_version_minor,
                old_hash: old.bytecode_hash.to_hex(),
                new_hash: new.bytecode_hash.to_hex(),
            });
        }

        needing_update.push(accessor);
    }

    for accessor in needing_update {
        accessor
            .update_provenance()
            .map_err(cache_error(&accessor.query().task_key))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::provider::{FunctionProvider, ValueProvider};
    use crate::versioning::VersioningMode;

    fn core_state(cache: &InMemoryCache) -> FlowState {
        let mut state = FlowState::new();
        state.install(Arc::new(ValueProvider::opaque(
            PERSISTENT_CACHE,
            PersistentCache::new(cache.clone()),
            "memory",
        )));
        state.install(Arc::new(ValueProvider::opaque(
            VERSIONING_POLICY,
            VersioningMode::Manual.policy(),
            "manual",
        )));
        state
    }

    fn counted(calls: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn single<T: Clone + 'static>(group: &ResultGroup) -> T {
        assert_eq!(group.len(), 1);
        group[0].downcast_ref::<T>().cloned().unwrap()
    }

    #[test]
    fn test_bootstrap_undefined() {
        let mut deriver = Deriver::new(FlowState::new(), Uuid::new_v4());
        let err = deriver.get_ready().unwrap_err();
        assert!(matches!(err, DeriveError::BootstrapUndefined(name) if name == PERSISTENT_CACHE));
    }

    #[test]
    fn test_bootstrap_multiple() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(
            ValueProvider::new(VERSIONING_POLICY, [1i64, 2])
                .unwrap()
                .persist(false),
        ));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.get_ready().unwrap_err();
        assert!(matches!(err, DeriveError::BootstrapMultiple { count: 2, .. }));
    }

    /// Bootstrap failures surface before any user entity is touched.
    fn assert_bootstrap_fails(values: Vec<i64>, check: impl Fn(&DeriveError) -> bool) {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(
            ValueProvider::new(PERSISTENT_CACHE, values)
                .unwrap()
                .persist(false),
        ));
        state.install(Arc::new(ValueProvider::new("x", [1i64]).unwrap()));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.derive(&"x".into()).unwrap_err();
        assert!(check(&err), "{err}");

        let log = deriver.take_log();
        assert!(log.iter().all(|record| record.task_key.dnode.is_internal()));
    }

    #[test]
    fn test_bootstrap_cache_without_values() {
        assert_bootstrap_fails(Vec::new(), |err| {
            matches!(err, DeriveError::BootstrapUndefined(name) if name == PERSISTENT_CACHE)
        });
    }

    #[test]
    fn test_bootstrap_cache_with_two_values() {
        assert_bootstrap_fails(vec![1, 2], |err| {
            matches!(
                err,
                DeriveError::BootstrapMultiple { entity, count: 2 } if entity == PERSISTENT_CACHE
            )
        });
    }

    #[test]
    fn test_unpersistable_outputs_fail_before_computing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bump = counted(&calls);

        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(
            FunctionProvider::with_outputs(["a"], Vec::<&str>::new(), move |_| {
                bump();
                let value: Dynamic = Arc::new(1i64);
                Ok(vec![value])
            })
            .persist(true),
        ));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.get_ready().unwrap_err();
        assert!(matches!(err, DeriveError::NotPersistable { ref entity, .. } if entity == "a"));

        assert!(deriver.derive(&"a".into()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bootstrap_type() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::opaque(VERSIONING_POLICY, "auto", "auto")));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.get_ready().unwrap_err();
        assert!(matches!(err, DeriveError::BootstrapType { entity, .. } if entity == VERSIONING_POLICY));
    }

    #[test]
    fn test_premature_persistence() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::new("mode", ["auto".to_string()]).unwrap()));
        state.install(Arc::new(FunctionProvider::opaque(
            VERSIONING_POLICY,
            ["mode"],
            |inputs| {
                let mode: VersioningMode = inputs.get::<String>("mode")?.parse()?;
                Ok(mode.policy())
            },
        )));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.get_ready().unwrap_err();
        assert!(matches!(err, DeriveError::PrematurePersistence(name) if name == "mode"));
    }

    #[test]
    fn test_bootstrap_is_logged_below_info() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::new("x", [1i64]).unwrap()));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        deriver.derive(&"x".into()).unwrap();

        let log = deriver.take_log();
        let (core, user): (Vec<_>, Vec<_>) = log
            .iter()
            .partition(|record| record.task_key.dnode.is_internal());

        assert!(!core.is_empty());
        assert!(core.iter().all(|record| record.level == Level::DEBUG));
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].level, Level::INFO);
        assert!(deriver.take_log().is_empty());
    }

    #[test]
    fn test_shared_dependency_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bump = counted(&calls);

        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::new("x", [1i64]).unwrap()));
        state.install(Arc::new(FunctionProvider::new("base", ["x"], move |inputs| {
            bump();
            Ok(inputs.get::<i64>("x")? * 10)
        })));
        state.install(Arc::new(FunctionProvider::new("left", ["base"], |inputs| {
            Ok(inputs.get::<i64>("base")? + 1)
        })));
        state.install(Arc::new(FunctionProvider::new("right", ["base"], |inputs| {
            Ok(inputs.get::<i64>("base")? + 2)
        })));
        state.install(Arc::new(FunctionProvider::new(
            "sum",
            ["left", "right"],
            |inputs| Ok(inputs.get::<i64>("left")? + inputs.get::<i64>("right")?),
        )));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let group = deriver.derive(&"sum".into()).unwrap();
        assert_eq!(single::<i64>(&group), 23);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deep_chain() {
        const DEPTH: usize = 2000;

        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::new("e0", [0i64]).unwrap()));
        for ix in 1..DEPTH {
            let dep = format!("e{}", ix - 1);
            state.install(Arc::new(
                FunctionProvider::new(format!("e{ix}"), [dep.clone()], move |inputs| {
                    Ok(inputs.get::<i64>(&dep)? + 1)
                })
                .persist(false),
            ));
        }

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let group = deriver.derive(&format!("e{}", DEPTH - 1).into()).unwrap();
        assert_eq!(single::<i64>(&group), DEPTH as i64 - 1);
    }

    #[test]
    fn test_changes_per_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = InMemoryCache::new();

        let state = {
            let bump = counted(&calls);
            let mut state = core_state(&cache);
            state.install(Arc::new(
                FunctionProvider::new("now", Vec::<&str>::new(), move |_| {
                    bump();
                    Ok(1i64)
                })
                .changes_per_run(true),
            ));
            state
        };

        let run = |id: Uuid| {
            let mut deriver = Deriver::new(state.clone(), id);
            single::<i64>(&deriver.derive(&"now".into()).unwrap())
        };

        let id = Uuid::new_v4();
        run(id);
        run(id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        run(Uuid::new_v4());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_task_failure() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(FunctionProvider::new(
            "broken",
            Vec::<&str>::new(),
            |_| -> anyhow::Result<i64> { anyhow::bail!("no luck") },
        )));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.derive(&"broken".into()).unwrap_err();
        assert!(matches!(err, DeriveError::Task { ref task, .. } if task == "broken()"));
    }

    #[test]
    fn test_output_arity() {
        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(FunctionProvider::with_outputs(
            ["a", "b"],
            Vec::<&str>::new(),
            |_| {
                let value: Dynamic = Arc::new(1i64);
                Ok(vec![value])
            },
        )));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        let err = deriver.derive(&"a".into()).unwrap_err();
        assert!(matches!(err, DeriveError::TaskArity { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_multiple_outputs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bump = counted(&calls);

        let mut state = core_state(&InMemoryCache::new());
        state.install(Arc::new(ValueProvider::new("x", [3i64]).unwrap()));
        state.install(Arc::new(FunctionProvider::with_outputs(
            ["half", "rest"],
            ["x"],
            move |inputs| {
                bump();
                let x = *inputs.get::<i64>("x")?;
                let half: Dynamic = Arc::new(x / 2);
                let rest: Dynamic = Arc::new(x % 2);
                Ok(vec![half, rest])
            },
        )));

        let mut deriver = Deriver::new(state, Uuid::new_v4());
        assert_eq!(single::<i64>(&deriver.derive(&"half".into()).unwrap()), 1);
        assert_eq!(single::<i64>(&deriver.derive(&"rest".into()).unwrap()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
