//! Reactive Primitives
//!
//! This module implements the typed layer of the reactive graph: a store
//! that owns every node, handles to those nodes, and the ways values enter
//! and leave the graph.
//!
//! # Concepts
//!
//! ## Sources
//!
//! A source node wraps an external asynchronous stream, such as the current
//! identity token or a remote collection watch. Each item the stream yields
//! becomes the node's value; a stream error becomes the node's error state,
//! which readers can tell apart from an ordinary "nothing here" value.
//!
//! ## State
//!
//! A state node is a mutable cell, set by commands. The study session lives
//! in one.
//!
//! ## Derived nodes
//!
//! A derived node caches a value computed from other nodes. It recomputes
//! only when something it read actually changed value.
//!
//! ## Families
//!
//! A family is a keyed cache of nodes: one node per distinct key, built on
//! demand, optionally pinned so it outlives its subscribers.
//!
//! # Implementation Notes
//!
//! There is no process-wide registry. Every node belongs to an explicit
//! [`Store`], and tests build a fresh store per case. Dependencies are
//! tracked through the [`Scope`] passed to each computation rather than
//! through ambient thread-local state.

mod family;
mod node;
mod scope;
mod store;
mod subscription;

pub use family::Family;
pub use node::{Node, NodeSpec, Outcome};
pub use scope::Scope;
pub use store::Store;
pub use subscription::Subscription;
