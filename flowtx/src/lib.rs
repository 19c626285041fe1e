#![allow(
    clippy::type_complexity,
)]
//! # flowtx - Transaction demarcation for message-flow runtimes
//!
//! flowtx coordinates the transactions that processing steps of an
//! integration pipeline run under. It does not implement a resource manager;
//! it binds, begins, suspends and resolves transactions over resources that
//! adapters supply.
//!
//! ## Key Features
//!
//! - **Per-worker registry**: at most one transaction bound to each worker,
//!   with suspend/resume and isolate/restore stacks
//! - **Local transactions** over a single resource, resolved through adapter hooks
//! - **Distributed transactions** over any number of enlistable resources,
//!   coordinated by an external transaction manager
//! - **Delegate transactions** that pick their kind on the first resource binding
//! - **Demarcation actions** (`BEGIN_OR_JOIN`, `NOT_SUPPORTED`, ...) applied by
//!   [transaction::TransactionTemplate]
//! - **Lifecycle notifications** for begin, commit and rollback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowtx::runtime::TxRuntime;
//! use flowtx::transaction::*;
//!
//! let runtime = TxRuntime::builder()
//!     .application_name("orders")
//!     .transaction_manager(manager)
//!     .build()?;
//!
//! let config = TransactionConfig::new(TransactionAction::BeginOrJoin)
//!     .with_factory(Arc::new(DistributedTransactionFactory::new()));
//! let template = TransactionTemplate::new(Some(config), runtime.clone())?;
//!
//! template.execute(|| {
//!     let tx = runtime.registry().current().expect("bound by the template");
//!     tx.enlist(ResourceKey::object(queue_factory.clone()), Resource::xa(session))?;
//!     send_order(&order)
//! })?;
//! ```
//!
//! ## Design
//!
//! Public types follow the PIMPL pattern: a thin handle around an `Arc` of
//! the implementation. Handles are cheap to clone and share state, which is
//! how a single runtime is handed to every step runner.

pub mod common;
pub mod errors;
pub mod runtime;
pub mod runtime_builder;
pub mod runtime_config;
pub mod transaction;

pub use common::{atomic, Atomic};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logging() {
    colog::init();
}
