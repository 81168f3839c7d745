pub mod advisory;
pub mod circuit;
pub mod queue;
pub mod registry;
pub mod store;
