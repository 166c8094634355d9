#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod dag;
mod error;
mod fingerprint;
mod hash;
mod log;
mod logic;
mod meta;
mod rescan;
mod run;
mod stale;
mod task;

pub use crate::dag::TaskDag;
pub use crate::error::{StoreError, TaskError};
pub use crate::fingerprint::{Fingerprint, FingerprintEngine, diff};
pub use crate::hash::Hash32;
pub use crate::log::RunLog;
pub use crate::logic::{FnLogic, Logic};
pub use crate::meta::{MetadataStore, PathRecord, StoreLock, TaskMetadata};
pub use crate::rescan::{Drift, RescanTask};
pub use crate::run::{RunContext, Runner};
pub use crate::stale::Reason;
pub use crate::task::{IdentityKey, Status, Task, TaskBuilder};
