use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// How code changes are reconciled with cached artifacts. This is the value
/// type of the `core__versioning_policy` bootstrap entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersioningPolicy {
    /// Compare the bytecode hash of cached artifacts against the current code
    /// and fail when the code changed without a version bump.
    pub check_for_bytecode_errors: bool,
    /// Any code change invalidates cached artifacts.
    pub treat_bytecode_as_functional: bool,
}

/// Named presets for [`VersioningPolicy`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersioningMode {
    /// Trust declared versions only.
    #[default]
    Manual,
    /// Trust declared versions, but fail on unversioned code changes.
    Assist,
    /// Ignore declared versions in favor of the code itself.
    Auto,
}

impl VersioningMode {
    pub fn policy(self) -> VersioningPolicy {
        match self {
            VersioningMode::Manual => VersioningPolicy {
                check_for_bytecode_errors: false,
                treat_bytecode_as_functional: false,
            },
            VersioningMode::Assist => VersioningPolicy {
                check_for_bytecode_errors: true,
                treat_bytecode_as_functional: false,
            },
            VersioningMode::Auto => VersioningPolicy {
                check_for_bytecode_errors: false,
                treat_bytecode_as_functional: true,
            },
        }
    }
}

impl From<VersioningMode> for VersioningPolicy {
    fn from(mode: VersioningMode) -> Self {
        mode.policy()
    }
}

impl fmt::Display for VersioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VersioningMode::Manual => "manual",
            VersioningMode::Assist => "assist",
            VersioningMode::Auto => "auto",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown versioning mode '{0}'; expected one of: manual, assist, auto")]
pub struct ParseModeError(String);

impl FromStr for VersioningMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(VersioningMode::Manual),
            "assist" => Ok(VersioningMode::Assist),
            "auto" => Ok(VersioningMode::Auto),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}
