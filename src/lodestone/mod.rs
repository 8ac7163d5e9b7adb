pub mod admin;
pub mod app;
pub mod config;
pub mod filter;
pub mod limiter;
pub mod logging;
pub mod net;
pub mod notify;
pub mod protocol;
pub mod proxy;
pub mod proxy_protocol;
pub mod router;
pub mod scaler;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
