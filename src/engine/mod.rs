//! The derivation engine.
//!
//! Providers describe entities; [`plan::FlowPlan`] turns them into a static
//! graph of task plans; [`deriver::Deriver`] walks that graph on demand,
//! loading what the persistent cache already holds and computing the rest.

pub mod blockage;
pub mod dag;
pub mod deriver;
pub mod logger;
pub mod plan;
pub mod provenance;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::Dynamic;
use crate::error::DeriveError;
use crate::key::{CaseKey, DescriptorNode, KeySpace, TaskKey};
use crate::protocol::Protocol;
use crate::provider::TupleProvider;

use self::provenance::CodeFingerprint;

type TaskFn = dyn Fn(&[Dynamic]) -> anyhow::Result<Vec<Dynamic>> + Send + Sync;

/// A unit of computation producing one value per key from one value per
/// dependency key.
#[derive(Clone)]
pub struct Task {
    pub keys: Vec<TaskKey>,
    pub dep_keys: Vec<TaskKey>,
    compute: Arc<TaskFn>,
    /// The task returns a value it already holds, so running it is not worth
    /// reporting as a computation.
    pub is_simple_lookup: bool,
}

impl Task {
    pub fn new<F>(keys: Vec<TaskKey>, dep_keys: Vec<TaskKey>, compute: F) -> Self
    where
        F: Fn(&[Dynamic]) -> anyhow::Result<Vec<Dynamic>> + Send + Sync + 'static,
    {
        Self {
            keys,
            dep_keys,
            compute: Arc::new(compute),
            is_simple_lookup: false,
        }
    }

    /// A task with no dependencies that returns `value`.
    pub fn lookup(key: TaskKey, value: Dynamic) -> Self {
        Self {
            keys: vec![key],
            dep_keys: Vec::new(),
            compute: Arc::new(move |_| Ok(vec![value.clone()])),
            is_simple_lookup: true,
        }
    }

    pub fn compute(&self, dep_values: &[Dynamic]) -> anyhow::Result<Vec<Dynamic>> {
        (self.compute)(dep_values)
    }

    pub fn key_for_dnode(&self, dnode: &DescriptorNode) -> Option<&TaskKey> {
        self.keys.iter().find(|key| &key.dnode == dnode)
    }

    pub fn position_of(&self, key: &TaskKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("keys", &self.keys)
            .field("dep_keys", &self.dep_keys)
            .field("is_simple_lookup", &self.is_simple_lookup)
            .finish_non_exhaustive()
    }
}

/// Static attributes shared by every entity a provider defines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityAttrs {
    pub names: Vec<DescriptorNode>,
    pub persist: bool,
    pub memoize: bool,
    /// The entity may produce a different value on every run, even when
    /// nothing it depends on changed.
    pub changes_per_run: bool,
}

impl EntityAttrs {
    pub fn new(names: impl IntoIterator<Item = impl Into<DescriptorNode>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            persist: true,
            memoize: true,
            changes_per_run: false,
        }
    }

    pub(crate) fn validate(&self, dnode: &DescriptorNode) -> Result<(), DeriveError> {
        if self.persist || self.memoize {
            Ok(())
        } else {
            Err(DeriveError::NotRetrievable(dnode.to_string()))
        }
    }
}

/// Checks a provider's attributes against the protocols of its outputs, before
/// anything is derived.
pub(crate) fn validate_provider(
    dnode: &DescriptorNode,
    provider: &dyn Provider,
) -> Result<(), DeriveError> {
    let attrs = provider.attrs();
    attrs.validate(dnode)?;

    if attrs.persist {
        for name in &attrs.names {
            let protocol = provider.protocol_for(name);
            if !protocol.can_persist() {
                return Err(DeriveError::NotPersistable {
                    entity: name.to_string(),
                    protocol: protocol.name(),
                });
            }
        }
    }

    Ok(())
}

/// Everything the engine needs to know about how some entities are derived.
pub trait Provider: Send + Sync {
    fn attrs(&self) -> &EntityAttrs;

    fn get_dependency_dnodes(&self) -> Vec<DescriptorNode>;

    fn get_key_space(&self, dep_key_spaces: &HashMap<DescriptorNode, KeySpace>) -> KeySpace;

    /// One task per case key. Each task must produce, at one case key, a value
    /// for every name in [`EntityAttrs::names`].
    fn get_tasks(
        &self,
        dep_key_spaces: &HashMap<DescriptorNode, KeySpace>,
        dep_task_key_lists: &HashMap<DescriptorNode, Vec<TaskKey>>,
    ) -> anyhow::Result<Vec<Task>>;

    fn get_code_fingerprint(&self, case_key: &CaseKey) -> CodeFingerprint;

    fn protocol_for(&self, dnode: &DescriptorNode) -> Arc<dyn Protocol>;

    fn doc_for(&self, _dnode: &DescriptorNode) -> Option<String> {
        None
    }
}

/// An immutable flow definition: which provider defines each entity.
#[derive(Clone, Default)]
pub struct FlowState {
    providers: HashMap<DescriptorNode, Arc<dyn Provider>>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under each of its names. A provider previously
    /// defining any of those names is removed entirely, including the names
    /// it defined that the new provider does not.
    pub fn install(&mut self, provider: Arc<dyn Provider>) {
        for name in &provider.attrs().names {
            if let Some(displaced) = self.providers.remove(name) {
                for other in &displaced.attrs().names {
                    self.providers.remove(other);
                }
            }
        }

        for name in &provider.attrs().names {
            self.providers.insert(name.clone(), provider.clone());
        }
    }

    /// Looks up the provider for a node. Tuples which were not explicitly
    /// defined are assembled from their parts.
    pub fn get_provider(&self, dnode: &DescriptorNode) -> Option<Arc<dyn Provider>> {
        match self.providers.get(dnode) {
            Some(provider) => Some(provider.clone()),
            None => match dnode {
                DescriptorNode::Tuple(children) => {
                    Some(Arc::new(TupleProvider::new(children.clone())))
                }
                DescriptorNode::Entity(_) => None,
            },
        }
    }

    pub fn defines(&self, dnode: &DescriptorNode) -> bool {
        self.providers.contains_key(dnode)
    }

    pub fn dnodes(&self) -> impl Iterator<Item = &DescriptorNode> {
        self.providers.keys()
    }
}
