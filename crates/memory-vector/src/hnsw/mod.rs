//! Hierarchical Navigable Small World index.

mod graph;
mod visited;

pub(crate) use graph::{Graph, HnswParams, Node};
