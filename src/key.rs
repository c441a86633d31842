//! Addresses in the derivation graph.
//!
//! Every value the engine produces lives at a [`TaskKey`]: a descriptor node
//! naming *what* is produced, and a [`CaseKey`] naming *which variation* of it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::ArcStr;

/// Stable identifier of a named computation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityName(ArcStr);

impl EntityName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved graph address of an entity, or of a structured group of entities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorNode {
    Entity(EntityName),
    Tuple(Vec<DescriptorNode>),
}

impl DescriptorNode {
    pub fn entity(name: impl AsRef<str>) -> Self {
        DescriptorNode::Entity(EntityName::new(name))
    }

    pub fn tuple(children: impl IntoIterator<Item = impl Into<DescriptorNode>>) -> Self {
        DescriptorNode::Tuple(children.into_iter().map(Into::into).collect())
    }

    /// Returns the entity name if this node addresses a single entity.
    pub fn entity_name(&self) -> Option<&EntityName> {
        match self {
            DescriptorNode::Entity(name) => Some(name),
            DescriptorNode::Tuple(_) => None,
        }
    }

    /// Internal entities are the `core__` bootstrap machinery.
    pub fn is_internal(&self) -> bool {
        match self {
            DescriptorNode::Entity(name) => name.as_str().starts_with("core__"),
            DescriptorNode::Tuple(children) => children.iter().all(DescriptorNode::is_internal),
        }
    }
}

impl fmt::Display for DescriptorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorNode::Entity(name) => write!(f, "{name}"),
            DescriptorNode::Tuple(children) => {
                f.write_str("<")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{child}")?;
                }
                f.write_str(">")
            }
        }
    }
}

impl From<&str> for DescriptorNode {
    fn from(name: &str) -> Self {
        DescriptorNode::entity(name)
    }
}

impl From<String> for DescriptorNode {
    fn from(name: String) -> Self {
        DescriptorNode::entity(name)
    }
}

impl From<EntityName> for DescriptorNode {
    fn from(name: EntityName) -> Self {
        DescriptorNode::Entity(name)
    }
}

impl From<&DescriptorNode> for DescriptorNode {
    fn from(dnode: &DescriptorNode) -> Self {
        dnode.clone()
    }
}

/// One point in an entity's variation space: parameter name to value token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseKey {
    tokens: BTreeMap<ArcStr, ArcStr>,
}

impl CaseKey {
    pub fn single(name: impl AsRef<str>, token: impl AsRef<str>) -> Self {
        let mut tokens = BTreeMap::new();
        tokens.insert(name.as_ref().into(), token.as_ref().into());
        Self { tokens }
    }

    pub fn token(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(AsRef::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(AsRef::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Combines two case keys, or returns `None` if they disagree on any
    /// shared parameter.
    pub fn merge(&self, other: &CaseKey) -> Option<CaseKey> {
        let mut tokens = self.tokens.clone();

        for (name, token) in &other.tokens {
            match tokens.get(name) {
                Some(existing) if existing != token => return None,
                Some(_) => {}
                None => {
                    tokens.insert(name.clone(), token.clone());
                }
            }
        }

        Some(CaseKey { tokens })
    }
}

impl fmt::Display for CaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, token)) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={token}")?;
        }
        Ok(())
    }
}

/// The set of parameter names an entity varies over.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySpace(BTreeSet<ArcStr>);

impl KeySpace {
    pub fn new(names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self(names.into_iter().map(|name| name.as_ref().into()).collect())
    }

    pub fn union<'a>(spaces: impl IntoIterator<Item = &'a KeySpace>) -> Self {
        Self(spaces.into_iter().flat_map(|space| space.0.iter().cloned()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The unique address of one output slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub dnode: DescriptorNode,
    pub case_key: CaseKey,
}

impl TaskKey {
    pub fn new(dnode: impl Into<DescriptorNode>, case_key: CaseKey) -> Self {
        Self {
            dnode: dnode.into(),
            case_key,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.dnode, self.case_key)
    }
}
