use std::net::TcpListener;
use std::sync::Arc;

use log::{info, warn};

use metrics::{Metrics, Registry};
use utils::log::init_log;
use utils::{ControllerConfig, SystemClock};

use anyhow::Result;
pub use controller::*;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::load()?;
    init_log(&config.log_level)?;
    info!("Starting controller");

    let metrics = Metrics::new(Registry::new(), Arc::new(SystemClock))?;

    let listener = TcpListener::bind(&config.metrics_listen_address)?;
    info!("Serving metrics on {}", listener.local_addr()?);
    let server = web::new_server(&metrics, listener, &config)?;
    let server_handle = server.handle();

    let (_manager, drainer) = Manager::new(metrics, &config).await?;

    tokio::select! {
        _ = drainer => {
            warn!("controller drained");
            server_handle.stop(true).await;
        }
        result = server => {
            result?;
            info!("actix exited");
        }
    }

    Ok(())
}
