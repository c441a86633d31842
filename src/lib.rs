#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod flow;
mod key;
mod utils;

pub mod cache;
pub mod engine;
pub mod protocol;
pub mod provider;
pub mod versioning;

pub use crate::core::{Dynamic, Hash32};
pub use crate::error::{DeriveError, FlowError};
pub use crate::flow::{Flow, FlowBuilder};
pub use crate::key::{CaseKey, DescriptorNode, EntityName, KeySpace, TaskKey};
pub use crate::provider::{FunctionProvider, Inputs, TupleProvider, ValueProvider};
pub use crate::versioning::{VersioningMode, VersioningPolicy};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
