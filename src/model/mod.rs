pub mod definition;
pub mod graph;
pub mod manifest;
pub mod registry;
