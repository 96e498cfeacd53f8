pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod sandbox;
pub mod server;
pub mod util;
pub mod workspace;
