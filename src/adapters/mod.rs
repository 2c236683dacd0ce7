pub mod definition_sources;
pub mod http_client;
pub mod http_handler;
pub mod http_server;
pub mod middleware;
pub mod reverse_proxy;

/// Re-export commonly used types from adapters
pub use definition_sources::{FileDefinitionSource, MemoryDefinitionSource};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::*;
pub use reverse_proxy::ReverseProxy;
