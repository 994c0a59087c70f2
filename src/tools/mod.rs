pub mod executor;
pub mod host;
pub mod naming;
pub mod provider;
pub mod registry;
pub mod validate;

pub use executor::CallPolicy;
pub use host::HostProvider;
pub use naming::{parse_scoped_name, scoped_name, ScopedName};
pub use provider::{Capability, OperationSpec, ToolDefinition, ToolProvider};
pub use registry::{ToolOutput, ToolRouter, ToolSession};
