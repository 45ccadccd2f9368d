use color_eyre::eyre::Result;
use tracing::info;

use load_balancer::prelude::*;
use load_balancer::utils::tracing::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing()?;

    let settings = Settings::new()?;
    let load_balancer = LoadBalancer::new(settings)?;

    tokio::select! {
        res = load_balancer.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
