mod lodestone;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lodestone",
    version,
    about = "Lodestone - Minecraft handshake-routing reverse proxy"
)]
struct Cli {
    /// Path to Lodestone config file (.toml/.yaml/.yml). If omitted, uses LODESTONE_CONFIG; then auto-detects lodestone.toml > lodestone.yaml > lodestone.yml from CWD; then falls back to the OS default path.
    #[arg(long, env = "LODESTONE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lodestone::run(cli.config).await
}
