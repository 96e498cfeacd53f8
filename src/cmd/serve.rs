//! HTTP server command: `buildpipe serve`.

use anyhow::Result;
use buildpipe::config::BuildpipeConfig;
use buildpipe::server::{self, ServerConfig};

pub async fn cmd_serve(config: BuildpipeConfig, host: String, port: u16, dev: bool) -> Result<()> {
    server::start_server(
        config,
        ServerConfig {
            host,
            port,
            dev_mode: dev,
        },
    )
    .await
}
