//! Tool registry: the flattened set of tools the hub can route invocations to.

mod registry;

pub use registry::{Route, Tool, ToolRegistry};
