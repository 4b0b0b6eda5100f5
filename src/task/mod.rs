//! # Task Records
//!
//! Wire format of a deferred call and the codec that moves live values
//! through the side-store.

pub mod args;
pub mod codec;
pub mod record;

pub use args::{Arg, Instance, RunOptions, Target};
pub use codec::{Rehydrated, TaskCodec};
pub use record::{decode, DecodedTask, InstanceSource, TaskRecord};
