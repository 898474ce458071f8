//! Service dependency graph: registration, validation, ordering and status.
//!
//! Services are registered with the ids they depend on, then [`DependencyGraph::validate`]
//! checks for dangling edges and cycles and caches a deterministic topological
//! order. During a run the graph tracks each node's [`ServiceStatus`]; a node
//! only becomes ready once every dependency is running.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod graph;
mod node;

pub use error::{Error, Result};
pub use graph::{BlockedService, DependencyGraph};
pub use node::{ServiceNode, ServiceStatus};
