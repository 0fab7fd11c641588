//! The store facade: configuration, engine, sessions, contexts.

mod config;
mod contexts;
mod core;
mod pending;
mod session;

pub use config::{CheckpointKind, ConfigError, KvConfig};
pub use contexts::{
    ClosureRmwContext, DeleteContext, ReadContext, RmwContext, SimpleReadContext,
    SimpleUpsertContext, UpsertContext,
};
pub use core::KvStore;
pub use session::{CompletedOp, Session};
