use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ragdesk_core::config::Config;
use ragdesk_core::{PriceTable, ReasoningEffort};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod chat;
mod kb;
mod session;

#[derive(Parser)]
#[command(name = "ragdesk")]
#[command(about = "Chat with a hosted model grounded in your own documents", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "ragdesk_core=warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Model management commands")]
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },

    #[command(about = "Start an interactive chat session")]
    Chat {
        /// Prompt preset to start with (financial, human-capital, comparison, motivation, none).
        #[arg(short, long)]
        mode: Option<String>,

        /// Collection to search, by id or name.
        #[arg(long)]
        collection: Option<String>,
    },

    #[command(about = "Knowledge base commands")]
    Kb {
        #[command(subcommand)]
        command: kb::KbCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    #[command(about = "Show current model")]
    Show,

    #[command(about = "Set the model and optionally its reasoning effort")]
    Set {
        #[arg(help = "Model id (e.g., 'gpt-5.2' or 'gpt-5-mini')")]
        model: String,

        #[arg(long, help = "none, minimal, low, medium or high")]
        effort: Option<ReasoningEffort>,
    },

    #[command(about = "List configured model prices")]
    Prices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Show => show_config(&cli.config),
        Commands::Model { command } => match command {
            ModelCommands::Show => show_model(&cli.config),
            ModelCommands::Set { model, effort } => set_model(&cli.config, &model, effort),
            ModelCommands::Prices => list_prices(&cli.config),
        },
        Commands::Chat { mode, collection } => {
            let config = load_config(&cli.config)?;
            chat::run(config, mode, collection).await
        }
        Commands::Kb { command } => {
            let config = load_config(&cli.config)?;
            kb::run(config, command).await
        }
    }
}

/// Loads the config file, falling back to defaults when it does not exist yet.
fn load_config(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Ok(Config::default());
    }
    Config::load(config_path).context("Failed to load config")
}

fn show_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "LLM:".bold());
    println!("  Model:            {}", config.llm.model.cyan());
    println!("  Base URL:         {}", config.llm.base_url);
    println!(
        "  Reasoning effort: {}",
        config
            .llm
            .reasoning_effort
            .map(|e| e.to_string())
            .unwrap_or_else(|| "default".to_string())
    );
    println!("  Timeout:          {}s", config.llm.request_timeout_secs);
    println!(
        "  Prompt mode:      {}",
        config.prompt_mode.as_deref().unwrap_or("custom")
    );
    println!();
    println!("{}", "Retry:".bold());
    println!("  Max attempts:     {}", config.retry.max_attempts);
    println!(
        "  Delay:            {}ms to {}ms (x{})",
        config.retry.initial_delay_ms, config.retry.max_delay_ms, config.retry.multiplier
    );
    println!();
    println!("{}", "Knowledge:".bold());
    println!("  Name encoding:    {:?}", config.knowledge.name_encoding);
    println!(
        "  Indexing poll:    every {}ms, up to {} times",
        config.knowledge.poll_interval_ms, config.knowledge.max_polls
    );
    println!(
        "  Cache:            {}",
        config
            .knowledge
            .cache_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    println!(
        "  Active:           {}",
        config.knowledge.active_collection.as_deref().unwrap_or("none")
    );
    println!();
    println!("{}", "Credentials:".bold());
    println!("  API key from:     ${}", config.credentials.env_var);

    Ok(())
}

fn show_model(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("{}: {}", "Current model".bold(), config.llm.model.cyan());
    Ok(())
}

fn set_model(config_path: &Path, model: &str, effort: Option<ReasoningEffort>) -> Result<()> {
    let mut config: serde_yaml::Value = if config_path.exists() {
        let content =
            std::fs::read_to_string(config_path).context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config")?
    } else {
        serde_yaml::to_value(Config::default()).context("Failed to build default config")?
    };

    let llm = config
        .as_mapping_mut()
        .context("Config file is not a mapping")?
        .entry(serde_yaml::Value::String("llm".to_string()))
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));

    if let Some(llm_map) = llm.as_mapping_mut() {
        llm_map.insert(
            serde_yaml::Value::String("model".to_string()),
            serde_yaml::Value::String(model.to_string()),
        );
        if let Some(effort) = effort {
            llm_map.insert(
                serde_yaml::Value::String("reasoning_effort".to_string()),
                serde_yaml::Value::String(effort.to_string()),
            );
        }
    }

    let updated_content = serde_yaml::to_string(&config).context("Failed to serialize config")?;

    std::fs::write(config_path, updated_content).context("Failed to write config file")?;

    println!("{} Model updated to: {}", "✓".green().bold(), model.cyan());
    let config = load_config(config_path)?;
    if !PriceTable::from_config(&config.pricing).contains(model) {
        println!(
            "{} No price configured for {}; costs will show as n/a",
            "!".yellow().bold(),
            model
        );
    }

    Ok(())
}

fn list_prices(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("{}", "Prices (USD per 1M tokens):".bold().green());
    println!();
    println!("  {:<20} {:>10} {:>10} {:>10}", "model", "input", "cached", "output");
    for (model, price) in &config.pricing.models {
        let marker = if *model == config.llm.model { "•".cyan() } else { " ".normal() };
        println!(
            "{} {:<20} {:>10.3} {:>10.3} {:>10.3}",
            marker, model, price.input, price.cached_input, price.output
        );
    }

    Ok(())
}
