use clap::Parser;
use satele_core::config::{AppConfig, DEFAULT_CONFIG_PATH};
use sateld::Bridge;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sateld", about = "Polls the task source and turns instructions into shell work")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "SATELE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Handle at most one task, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let start_dir = std::env::current_dir()?;
    let config = AppConfig::load(&args.config)?.finalize(&start_dir);

    let mut bridge = Bridge::new(config)?;
    let cfg = bridge.config();
    info!("config: {}", args.config);
    info!("install root: {}", cfg.install_root().display());
    info!("state dir: {}", cfg.state_dir().display());
    info!("task source: {}", cfg.bridge.base_url);
    info!("llm backends: {}", bridge.gateway().describe());
    info!("skills: dir={} mode={:?}", cfg.skills_dir().display(), cfg.skills.mode);
    match bridge.memory().map(|m| m.count()) {
        Some(Ok(n)) => info!("recall store: {n} entries"),
        Some(Err(err)) => tracing::warn!("recall store unreadable: {err}"),
        None => info!("recall store: disabled"),
    }
    info!("session cwd: {}", bridge.session().cwd().display());

    if args.once {
        let handled = bridge.run_once().await?;
        info!("single poll finished, task handled={handled}");
        return Ok(());
    }
    bridge.run_loop().await;
    Ok(())
}
