pub mod gateway;
pub mod plugin;
pub mod rate_limiter;
pub mod reload;
pub mod rewrite;
pub mod route_table;

pub use gateway::GatewayService;
pub use plugin::{PluginRegistry, RequestContext};
pub use rate_limiter::RouteRateLimiter;
pub use reload::{ReloadCoordinator, ReloadOutcome};
pub use route_table::{RouteCompiler, RouteTable};
