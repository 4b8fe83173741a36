#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-graph** – Dependency graphs for Flotilla.
//!
//! A generic directed-acyclic-graph container ([`Dag`]) with the operations
//! scheduling needs (Kahn topological sort, breadth-first execution
//! levelling, cycle extraction, critical path, transitive closures) and the
//! [`DependencyResolver`] that validates task graphs and turns them into
//! [`ExecutionPlan`]s.

mod dag;
mod resolver;

pub use dag::{Dag, GraphError};
pub use resolver::{DependencyResolver, ResolveOptions, Resolution};
