pub mod definition_source;
pub mod http_client;
pub mod http_server;
