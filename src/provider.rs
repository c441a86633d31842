//! Ready-made providers.
//!
//! - [`ValueProvider`] for assigned values, one task per value;
//! - [`FunctionProvider`] for functions of other entities, one task per
//!   compatible combination of dependency case keys;
//! - [`TupleProvider`] for tuples of entities, assembled on demand.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{Dynamic, Hash32};
use crate::engine::provenance::{CodeFingerprint, CodeVersion};
use crate::engine::{EntityAttrs, Provider, Task};
use crate::key::{CaseKey, DescriptorNode, KeySpace, TaskKey};
use crate::protocol::{Cbor, Opaque, Protocol, Unchecked};

/// Every compatible combination of one task key per dependency, along with
/// the merged case key of the combination.
fn cross_product(
    deps: &[DescriptorNode],
    dep_task_key_lists: &HashMap<DescriptorNode, Vec<TaskKey>>,
) -> anyhow::Result<Vec<(CaseKey, Vec<TaskKey>)>> {
    let mut combos = vec![(CaseKey::default(), Vec::new())];

    for dep in deps {
        let keys = dep_task_key_lists
            .get(dep)
            .ok_or_else(|| anyhow!("no task keys were resolved for dependency '{dep}'"))?;

        let mut next = Vec::with_capacity(combos.len() * keys.len());
        for (case_key, dep_keys) in &combos {
            for key in keys {
                if let Some(merged) = case_key.merge(&key.case_key) {
                    let mut dep_keys = dep_keys.clone();
                    dep_keys.push(key.clone());
                    next.push((merged, dep_keys));
                }
            }
        }

        combos = next;
    }

    Ok(combos)
}

fn union_key_space(
    deps: &[DescriptorNode],
    dep_key_spaces: &HashMap<DescriptorNode, KeySpace>,
) -> KeySpace {
    KeySpace::union(deps.iter().filter_map(|dep| dep_key_spaces.get(dep)))
}

/// Values of an entity assigned up front. Each value is its own case, keyed
/// by the entity name and the value's token.
pub struct ValueProvider {
    attrs: EntityAttrs,
    dnode: DescriptorNode,
    entries: Vec<(String, Dynamic)>,
    protocol: Arc<dyn Protocol>,
    doc: Option<String>,
}

impl ValueProvider {
    /// Tokens are the values' JSON encoding.
    pub fn new<T>(
        name: impl AsRef<str>,
        values: impl IntoIterator<Item = T>,
    ) -> Result<Self, serde_json::Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut entries: Vec<(String, Dynamic)> = Vec::new();
        for value in values {
            let token = serde_json::to_string(&value)?;
            if entries.iter().all(|(existing, _)| existing != &token) {
                entries.push((token, Arc::new(value)));
            }
        }

        Ok(Self::from_entries(name, entries, Cbor::<T>::shared()))
    }

    /// A single value which can't be serialized, identified by `token`. It is
    /// never persisted.
    pub fn opaque<T>(name: impl AsRef<str>, value: T, token: impl Into<String>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let entries: Vec<(String, Dynamic)> = vec![(token.into(), Arc::new(value))];
        Self::from_entries(name, entries, Opaque::<T>::shared()).persist(false)
    }

    fn from_entries(
        name: impl AsRef<str>,
        entries: Vec<(String, Dynamic)>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        let dnode = DescriptorNode::entity(name);

        Self {
            attrs: EntityAttrs::new([dnode.clone()]),
            dnode,
            entries,
            protocol,
            doc: None,
        }
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.attrs.persist = persist;
        self
    }

    pub fn memoize(mut self, memoize: bool) -> Self {
        self.attrs.memoize = memoize;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    fn case_key(&self, token: &str) -> CaseKey {
        CaseKey::single(self.dnode.to_string(), token)
    }
}

impl Provider for ValueProvider {
    fn attrs(&self) -> &EntityAttrs {
        &self.attrs
    }

    fn get_dependency_dnodes(&self) -> Vec<DescriptorNode> {
        Vec::new()
    }

    fn get_key_space(&self, _: &HashMap<DescriptorNode, KeySpace>) -> KeySpace {
        KeySpace::new([self.dnode.to_string()])
    }

    fn get_tasks(
        &self,
        _: &HashMap<DescriptorNode, KeySpace>,
        _: &HashMap<DescriptorNode, Vec<TaskKey>>,
    ) -> anyhow::Result<Vec<Task>> {
        Ok(self
            .entries
            .iter()
            .map(|(token, value)| {
                let key = TaskKey::new(self.dnode.clone(), self.case_key(token));
                Task::lookup(key, value.clone())
            })
            .collect())
    }

    fn get_code_fingerprint(&self, _: &CaseKey) -> CodeFingerprint {
        CodeFingerprint {
            version: CodeVersion::default(),
            bytecode_hash: Hash32::default(),
        }
    }

    fn protocol_for(&self, _: &DescriptorNode) -> Arc<dyn Protocol> {
        self.protocol.clone()
    }

    fn doc_for(&self, _: &DescriptorNode) -> Option<String> {
        self.doc.clone()
    }
}

/// Values of the provider's dependencies, by name.
pub struct Inputs {
    values: HashMap<DescriptorNode, Dynamic>,
}

impl Inputs {
    fn new(values: impl IntoIterator<Item = (DescriptorNode, Dynamic)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn value(&self, dnode: &DescriptorNode) -> Option<&Dynamic> {
        self.values.get(dnode)
    }

    pub fn get<T: 'static>(&self, name: &str) -> anyhow::Result<&T> {
        let value = self
            .value(&DescriptorNode::entity(name))
            .ok_or_else(|| anyhow!("'{name}' is not a dependency"))?;

        value
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow!("'{name}' is not a value of type {}", type_name::<T>()))
    }
}

type ComputeFn = dyn Fn(&Inputs) -> anyhow::Result<Vec<Dynamic>> + Send + Sync;

/// Entities computed by a function of other entities.
///
/// The code identity defaults to the function's type name. Use
/// [`FunctionProvider::code`] to pin it to something that tracks the
/// function's actual source, and [`FunctionProvider::version`] to declare
/// behavior changes.
pub struct FunctionProvider {
    attrs: EntityAttrs,
    deps: Vec<DescriptorNode>,
    compute: Arc<ComputeFn>,
    protocols: HashMap<DescriptorNode, Arc<dyn Protocol>>,
    default_protocol: Arc<dyn Protocol>,
    version: CodeVersion,
    bytecode_hash: Hash32,
    doc: Option<String>,
}

impl FunctionProvider {
    /// A function with a single serializable output.
    pub fn new<T, F>(
        name: impl AsRef<str>,
        deps: impl IntoIterator<Item = impl Into<DescriptorNode>>,
        function: F,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&Inputs) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::build::<F>(
            [DescriptorNode::entity(name)],
            deps,
            Arc::new(move |inputs: &Inputs| -> anyhow::Result<Vec<Dynamic>> {
                let value: Dynamic = Arc::new(function(inputs)?);
                Ok(vec![value])
            }),
            Cbor::<T>::shared(),
        )
    }

    /// A function with a single output which can't be serialized. It is never
    /// persisted.
    pub fn opaque<T, F>(
        name: impl AsRef<str>,
        deps: impl IntoIterator<Item = impl Into<DescriptorNode>>,
        function: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Inputs) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::build::<F>(
            [DescriptorNode::entity(name)],
            deps,
            Arc::new(move |inputs: &Inputs| -> anyhow::Result<Vec<Dynamic>> {
                let value: Dynamic = Arc::new(function(inputs)?);
                Ok(vec![value])
            }),
            Opaque::<T>::shared(),
        )
        .persist(false)
    }

    /// A function returning one value per name, in order. Outputs are not
    /// persisted unless each is given a protocol with
    /// [`FunctionProvider::protocol`] and persistence is turned on.
    pub fn with_outputs<F>(
        names: impl IntoIterator<Item = impl AsRef<str>>,
        deps: impl IntoIterator<Item = impl Into<DescriptorNode>>,
        function: F,
    ) -> Self
    where
        F: Fn(&Inputs) -> anyhow::Result<Vec<Dynamic>> + Send + Sync + 'static,
    {
        Self::build::<F>(
            names.into_iter().map(DescriptorNode::entity),
            deps,
            Arc::new(function),
            Unchecked::shared(),
        )
        .persist(false)
    }

    fn build<F>(
        names: impl IntoIterator<Item = DescriptorNode>,
        deps: impl IntoIterator<Item = impl Into<DescriptorNode>>,
        compute: Arc<ComputeFn>,
        default_protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self {
            attrs: EntityAttrs::new(names),
            deps: deps.into_iter().map(Into::into).collect(),
            compute,
            protocols: HashMap::new(),
            default_protocol,
            version: CodeVersion::default(),
            bytecode_hash: Hash32::hash(type_name::<F>()),
            doc: None,
        }
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.attrs.persist = persist;
        self
    }

    pub fn memoize(mut self, memoize: bool) -> Self {
        self.attrs.memoize = memoize;
        self
    }

    pub fn changes_per_run(mut self, changes_per_run: bool) -> Self {
        self.attrs.changes_per_run = changes_per_run;
        self
    }

    /// Declared major version; bump it when the function's behavior changes.
    pub fn version(mut self, major: impl Into<String>) -> Self {
        self.version.major = major.into();
        self
    }

    /// Declared minor version; bump it when the code changes but its
    /// behavior does not.
    pub fn minor(mut self, minor: impl Into<String>) -> Self {
        self.version.minor = Some(minor.into());
        self
    }

    /// Identity of the function's code.
    pub fn code(mut self, code: impl AsRef<[u8]>) -> Self {
        self.bytecode_hash = Hash32::hash(code);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn protocol(mut self, name: impl AsRef<str>, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.insert(DescriptorNode::entity(name), protocol);
        self
    }
}

impl Provider for FunctionProvider {
    fn attrs(&self) -> &EntityAttrs {
        &self.attrs
    }

    fn get_dependency_dnodes(&self) -> Vec<DescriptorNode> {
        self.deps.clone()
    }

    fn get_key_space(&self, dep_key_spaces: &HashMap<DescriptorNode, KeySpace>) -> KeySpace {
        union_key_space(&self.deps, dep_key_spaces)
    }

    fn get_tasks(
        &self,
        _: &HashMap<DescriptorNode, KeySpace>,
        dep_task_key_lists: &HashMap<DescriptorNode, Vec<TaskKey>>,
    ) -> anyhow::Result<Vec<Task>> {
        let combos = cross_product(&self.deps, dep_task_key_lists)?;

        Ok(combos
            .into_iter()
            .map(|(case_key, dep_keys)| {
                let keys = self
                    .attrs
                    .names
                    .iter()
                    .map(|name| TaskKey::new(name.clone(), case_key.clone()))
                    .collect();

                let deps = self.deps.clone();
                let compute = self.compute.clone();
                Task::new(keys, dep_keys, move |values| {
                    let inputs = Inputs::new(deps.iter().cloned().zip(values.iter().cloned()));
                    compute(&inputs)
                })
            })
            .collect())
    }

    fn get_code_fingerprint(&self, _: &CaseKey) -> CodeFingerprint {
        CodeFingerprint {
            version: self.version.clone(),
            bytecode_hash: self.bytecode_hash,
        }
    }

    fn protocol_for(&self, dnode: &DescriptorNode) -> Arc<dyn Protocol> {
        self.protocols
            .get(dnode)
            .cloned()
            .unwrap_or_else(|| self.default_protocol.clone())
    }

    fn doc_for(&self, _: &DescriptorNode) -> Option<String> {
        self.doc.clone()
    }
}

/// A tuple of entities. Its value at each case key is a `Vec<Dynamic>` of
/// the children's values, in order.
pub struct TupleProvider {
    attrs: EntityAttrs,
    children: Vec<DescriptorNode>,
}

impl TupleProvider {
    pub fn new(children: Vec<DescriptorNode>) -> Self {
        let mut attrs = EntityAttrs::new([DescriptorNode::Tuple(children.clone())]);
        attrs.persist = false;

        Self { attrs, children }
    }
}

impl Provider for TupleProvider {
    fn attrs(&self) -> &EntityAttrs {
        &self.attrs
    }

    fn get_dependency_dnodes(&self) -> Vec<DescriptorNode> {
        self.children.clone()
    }

    fn get_key_space(&self, dep_key_spaces: &HashMap<DescriptorNode, KeySpace>) -> KeySpace {
        union_key_space(&self.children, dep_key_spaces)
    }

    fn get_tasks(
        &self,
        _: &HashMap<DescriptorNode, KeySpace>,
        dep_task_key_lists: &HashMap<DescriptorNode, Vec<TaskKey>>,
    ) -> anyhow::Result<Vec<Task>> {
        let dnode = DescriptorNode::Tuple(self.children.clone());

        Ok(cross_product(&self.children, dep_task_key_lists)?
            .into_iter()
            .map(|(case_key, dep_keys)| {
                let key = TaskKey::new(dnode.clone(), case_key);
                Task::new(vec![key], dep_keys, |values| {
                    let tuple: Dynamic = Arc::new(values.to_vec());
                    Ok(vec![tuple])
                })
            })
            .collect())
    }

    fn get_code_fingerprint(&self, _: &CaseKey) -> CodeFingerprint {
        CodeFingerprint {
            version: CodeVersion::default(),
            bytecode_hash: Hash32::default(),
        }
    }

    fn protocol_for(&self, _: &DescriptorNode) -> Arc<dyn Protocol> {
        Opaque::<Vec<Dynamic>>::shared()
    }
}
