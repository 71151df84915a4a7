#![cfg(not(tarpaulin_include))]

use sheetgate::app;
use sheetgate::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Reads .env first, then the process environment
    let config = Config::from_env()?;
    log::info!(
        "Starting sheetgate {} with {} service account key(s) configured",
        sheetgate::VERSION,
        config.service_account_keys.len()
    );

    app::run(config).await?;

    Ok(())
}
