//! Strata Core
//!
//! This crate provides the state layer of the Strata study tracker.
//! It implements:
//!
//! - A dependency graph store with source, state and derived nodes
//! - Keyed caches of nodes with per-key keep-alive
//! - Identity-guarded bindings for remote collections
//! - The study session state machine and its timer
//!
//! Rendering, routing, authentication and the backend transport live
//! elsewhere and reach this crate only through the traits in [`bindings`].
//!
//! # Architecture
//!
//! - `graph`: untyped dependency topology and invalidation ordering
//! - `reactive`: the typed [`Store`] and everything that reads or writes it
//! - `bindings`: identity and remote-watch collaborators wired into the graph
//! - `session`: study session state, commands and tick scheduling
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_core::{Store, NodeSpec};
//!
//! let store = Store::new();
//!
//! // A mutable cell
//! let count = store.state(0);
//!
//! // A value derived from it
//! let doubled = store.derived(move |scope| Ok(scope.get(&count)? * 2));
//!
//! let mut values = store.watch(&doubled)?;
//! assert_eq!(values.next().await, Some(Ok(0)));
//!
//! store.set(&count, 5)?;
//! assert_eq!(values.next().await, Some(Ok(10)));
//! ```

pub mod bindings;
pub mod config;
pub mod error;
pub mod graph;
pub mod ids;
pub mod reactive;
pub mod session;

pub use config::Config;
pub use error::{GraphError, ReadError, UpstreamError};
pub use graph::{DisposalPolicy, NodeId};
pub use reactive::{Family, Node, NodeSpec, Outcome, Scope, Store, Subscription};
pub use session::{Phase, SessionMachine, SessionState};
