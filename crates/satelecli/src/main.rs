use std::path::PathBuf;

use clap::{Parser, Subcommand};
use satele_core::config::{AppConfig, DEFAULT_CONFIG_PATH};
use sateld::llm_gateway::LlmGateway;
use sateld::memory::RecallStore;
use sateld::skills::SkillProvider;
use sateld::task_source::TaskSource;
use sateld::{Bridge, Reply};

/// Poke individual pieces of the Satele bridge by hand.
#[derive(Parser)]
#[command(name = "satelecli", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "SATELE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the next pending task and print it as JSON (or `null`)
    Check,
    /// Report a result for a task id
    Reply { id: String, message: String },
    /// Run a command through the shell executor in the saved working directory
    Sh {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run the whole routing pipeline locally and print the reply
    Process {
        #[arg(required = true)]
        instruction: Vec<String>,
        /// Attach a media file (audio or image)
        #[arg(long)]
        media: Option<PathBuf>,
    },
    /// Print the skill catalogue, optionally ranked against a query
    Skills { query: Vec<String> },
    /// Inspect the recall store
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Number of stored entries
    Count,
    /// Delete every entry
    Clear,
    /// Show the entries most similar to a query
    Recall {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string()))
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(&cli.config)?.finalize(&std::env::current_dir()?);
    tracing::debug!(
        "config: {} (install root {})",
        cli.config,
        config.install_root().display()
    );

    match cli.command {
        Commands::Check => {
            let source = TaskSource::from_config(&config.bridge)?;
            match source.fetch_next().await? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("null"),
            }
        }
        Commands::Reply { id, message } => {
            let source = TaskSource::from_config(&config.bridge)?;
            if !source.report(&id, &message).await {
                anyhow::bail!("report for task {id} was not accepted");
            }
            println!("reported {id}");
        }
        Commands::Sh { command } => {
            let bridge = Bridge::new(config)?;
            println!("{}", bridge.shell(&command.join(" ")).await);
        }
        Commands::Process { instruction, media } => {
            let mut bridge = Bridge::new(config)?;
            match bridge.respond(&instruction.join(" "), media.as_deref()).await {
                Reply::Skip => println!("(handed off, nothing to report)"),
                Reply::Restart(ack) => println!("{ack}\n(restart is only performed by the daemon)"),
                Reply::Text(text) => println!("{text}"),
            }
        }
        Commands::Skills { query } => {
            let gateway = LlmGateway::from_config(&config);
            let provider = SkillProvider::from_config(&config);
            let query = query.join(" ");
            let catalog = provider
                .lookup(Some(query.as_str()).filter(|q| !q.is_empty()), &gateway)
                .await;
            if catalog.is_empty() {
                println!("no skills found under {}", config.skills_dir().display());
            } else {
                print!("{catalog}");
            }
        }
        Commands::Memory { action } => {
            let store = RecallStore::open(
                &PathBuf::from(&config.memory.sqlite_path),
                config.memory.item_max_chars,
            )?;
            match action {
                MemoryAction::Count => println!("{}", store.count()?),
                MemoryAction::Clear => println!("removed {} entries", store.clear()?),
                MemoryAction::Recall { query, limit } => {
                    let query = query.join(" ");
                    let gateway = LlmGateway::from_config(&config);
                    let embedding = gateway.embed(&query).await.ok();
                    let limit = limit.unwrap_or(config.memory.recall_limit);
                    for entry in store.recall(&query, embedding.as_deref(), limit)? {
                        println!("{entry}");
                    }
                }
            }
        }
    }
    Ok(())
}
