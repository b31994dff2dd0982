pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, ConnectionConfig, NetworkConfig, ServerConfig, GLOBAL_CONFIG,
};
pub use server::Server;
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
