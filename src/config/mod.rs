pub mod definition;
pub mod loader;
pub mod models;
pub mod validation;

pub use definition::{ApiRoute, Definition, PluginRef, Proxy, Upstream};
pub use loader::{load_definition, load_gateway_config};
pub use models::*;
pub use validation::{
    DefinitionValidator, GatewayConfigValidator, ValidationError, ValidationResult,
};
