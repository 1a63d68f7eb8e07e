//! Core engine: rate graph, cycle search, execution and the task loop.

pub mod accountant;
pub mod executor;
pub mod finder;
pub mod graph;
pub mod scanner;
pub mod scheduler;
