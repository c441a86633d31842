use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Blake3Hasher, Hash32};
use crate::key::CaseKey;

/// Declared version of a piece of code. A major bump means the behavior
/// changed; a minor bump means the code changed but the behavior did not.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeVersion {
    pub major: String,
    pub minor: Option<String>,
}

impl CodeVersion {
    pub fn new(major: impl Into<String>) -> Self {
        Self {
            major: major.into(),
            minor: None,
        }
    }

    pub fn with_minor(mut self, minor: impl Into<String>) -> Self {
        self.minor = Some(minor.into());
        self
    }
}

impl Default for CodeVersion {
    fn default() -> Self {
        Self::new("0")
    }
}

/// Identity of the code computing an entity at a given case key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodeFingerprint {
    pub version: CodeVersion,
    pub bytecode_hash: Hash32,
}

/// A dependency's contribution to a [`Provenance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProvenanceDigest {
    /// The dependency is not persisted: track its code and inputs.
    Provenance { functional: Hash32, exact: Hash32 },
    /// The dependency is persisted: track only what it produced.
    ValueHash(Hash32),
}

impl ProvenanceDigest {
    pub fn from_provenance(provenance: &Provenance) -> Self {
        ProvenanceDigest::Provenance {
            functional: provenance.functional_hash,
            exact: provenance.exact_hash,
        }
    }

    pub fn from_value_hash(value_hash: Hash32) -> Self {
        ProvenanceDigest::ValueHash(value_hash)
    }

    /// Distinguishes the two kinds in hash input.
    fn tag(&self) -> u8 {
        match self {
            ProvenanceDigest::Provenance { .. } => 0,
            ProvenanceDigest::ValueHash(_) => 1,
        }
    }

    fn functional_hash(&self) -> Hash32 {
        match *self {
            ProvenanceDigest::Provenance { functional, .. } => functional,
            ProvenanceDigest::ValueHash(hash) => hash,
        }
    }

    fn exact_hash(&self) -> Hash32 {
        match *self {
            ProvenanceDigest::Provenance { exact, .. } => exact,
            ProvenanceDigest::ValueHash(hash) => hash,
        }
    }
}

/// Everything a provenance is computed from.
pub struct Computation<'a> {
    pub code_fingerprint: &'a CodeFingerprint,
    pub case_key: &'a CaseKey,
    pub dep_digests: &'a [ProvenanceDigest],
    pub treat_bytecode_as_functional: bool,
    pub can_functionally_change_per_run: bool,
    pub flow_instance_id: Uuid,
}

/// Fingerprint of a task output.
///
/// The functional hash identifies an artifact in the persistent cache: it
/// covers only inputs which are declared to affect behavior. The exact hash
/// covers every input, so two provenances exactly match only when nothing at
/// all differs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub functional_hash: Hash32,
    pub exact_hash: Hash32,
    pub code_version_major: String,
    pub code_version_minor: Option<String>,
    pub bytecode_hash: Hash32,
}

impl Provenance {
    pub fn from_computation(computation: Computation<'_>) -> Self {
        let Computation {
            code_fingerprint,
            case_key,
            dep_digests,
            treat_bytecode_as_functional,
            can_functionally_change_per_run,
            flow_instance_id,
        } = computation;

        let functional_hash = {
            let mut hasher = Blake3Hasher::default();
            "functional".hash(&mut hasher);
            code_fingerprint.version.major.hash(&mut hasher);
            case_key.hash(&mut hasher);
            dep_digests.len().hash(&mut hasher);
            for digest in dep_digests {
                digest.tag().hash(&mut hasher);
                digest.functional_hash().hash(&mut hasher);
            }
            treat_bytecode_as_functional.hash(&mut hasher);
            if treat_bytecode_as_functional {
                code_fingerprint.bytecode_hash.hash(&mut hasher);
            }
            can_functionally_change_per_run.hash(&mut hasher);
            if can_functionally_change_per_run {
                flow_instance_id.hash(&mut hasher);
            }
            Hash32::from(hasher)
        };

        let exact_hash = {
            let mut hasher = Blake3Hasher::default();
            "exact".hash(&mut hasher);
            functional_hash.hash(&mut hasher);
            code_fingerprint.version.minor.hash(&mut hasher);
            code_fingerprint.bytecode_hash.hash(&mut hasher);
            dep_digests.len().hash(&mut hasher);
            for digest in dep_digests {
                digest.tag().hash(&mut hasher);
                digest.exact_hash().hash(&mut hasher);
            }
            Hash32::from(hasher)
        };

        Self {
            functional_hash,
            exact_hash,
            code_version_major: code_fingerprint.version.major.clone(),
            code_version_minor: code_fingerprint.version.minor.clone(),
            bytecode_hash: code_fingerprint.bytecode_hash,
        }
    }

    pub fn exactly_matches(&self, other: &Provenance) -> bool {
        self.exact_hash == other.exact_hash
    }

    /// Same declared version, different code: the author forgot to bump it.
    pub(crate) fn is_unversioned_change_from(&self, old: &Provenance) -> bool {
        self.code_version_major == old.code_version_major
            && self.code_version_minor == old.code_version_minor
            && self.bytecode_hash != old.bytecode_hash
    }
}
