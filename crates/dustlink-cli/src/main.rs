//! dustlink - MCP bridge to a Dust.tt agent.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dustlink_core::{Config, ConversationId};
use dustlink_dust::DustClient;
use dustlink_mcp::{McpServer, ToolHandler};
use dustlink_storage::{resolve_api_key, CredentialStore, KeychainStore, API_KEY_ENTRY};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dustlink")]
#[command(author, version, about = "Expose a Dust.tt agent as an MCP tool", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server on stdin/stdout (default)
    Serve,

    /// Send one query to the agent and print the reply
    Ask {
        /// The question or request for the agent
        query: String,

        /// Continue this conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Inspect or edit the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Manage the Dust API key in the OS keychain
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration (API key masked)
    Show,

    /// Print the config file location
    Path,

    /// Print one value, e.g. `dust.agent_name`
    Get { key: String },

    /// Set one value in the config file, e.g. `dust.workspace_id abc123`
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Save the Dust API key to the keychain
    SetKey { key: String },

    /// Remove the saved API key
    Clear,

    /// Show where the API key comes from
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Ask {
            query,
            conversation,
        } => ask(query, conversation).await,
        Commands::Config { command } => config_command(command),
        Commands::Auth { command } => auth_command(command),
    }
}

/// Logs go to stderr: stdout carries the MCP stream.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Load file + environment, fill the API key from the keychain, validate.
fn load_config() -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if resolve_api_key(&mut config, &KeychainStore::new()) {
        tracing::info!("Using API key from keychain");
    }
    config.validate()?;
    if config.poll_outlasts_timeout() {
        tracing::warn!(
            timeout_secs = config.mcp.timeout_secs,
            poll_wait_secs = config.polling.worst_case_wait().as_secs(),
            "A polling step can outlast MCP_TIMEOUT; slow replies end as timeouts, see debug logs for request curls"
        );
    }
    Ok(config)
}

fn build_handler(config: &Config) -> anyhow::Result<ToolHandler> {
    let client = DustClient::new(config)?;
    Ok(ToolHandler::new(Arc::new(client), config))
}

async fn serve() -> anyhow::Result<()> {
    let config = load_config()?;
    tracing::info!(
        workspace = %config.dust.workspace_id,
        agent = %config.dust.agent_name,
        domain = %config.dust.domain,
        "Starting {}",
        config.mcp.name
    );

    let handler = build_handler(&config)?;
    let mut server = McpServer::new(handler, config.mcp.name.clone());
    server.run().await?;
    Ok(())
}

async fn ask(query: String, conversation: Option<String>) -> anyhow::Result<()> {
    let config = load_config()?;
    let handler = build_handler(&config)?;
    if let Some(id) = conversation {
        handler.resume(ConversationId::new(id)).await;
    }

    let arguments = serde_json::json!({ "query": query });
    let result = handler.execute(handler.tool_name(), Some(arguments)).await;

    if let Some(id) = handler.active_conversation().await {
        eprintln!("Conversation: {}", id);
    }
    if result.is_error() {
        anyhow::bail!(result.text_content());
    }
    println!("{}", result.text_content());
    Ok(())
}

fn config_command(command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let mut config = Config::load()?;
            resolve_api_key(&mut config, &KeychainStore::new());
            let rendered = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", rendered);
            match config.get("dust.api_key")? {
                Some(masked) => println!("# dust.api_key = {}", masked),
                None => println!("# dust.api_key is not set"),
            }
            if let Err(e) = config.validate() {
                println!("# {}", e);
            }
        }
        ConfigCommands::Path => {
            println!("{}", Config::config_path()?.display());
        }
        ConfigCommands::Get { key } => {
            let mut config = Config::load()?;
            resolve_api_key(&mut config, &KeychainStore::new());
            match config.get(&key)? {
                Some(value) => println!("{}", value),
                None => println!("(not set)"),
            }
        }
        ConfigCommands::Set { key, value } => {
            // Only the file layer is edited so environment values are not persisted.
            let path = Config::config_path()?;
            let mut config = Config::load_from(&path)?;
            config.set(&key, &value)?;
            config.save_to(&path)?;
            println!("Set {} in {}", key, path.display());
        }
    }
    Ok(())
}

fn auth_command(command: AuthCommands) -> anyhow::Result<()> {
    let store = KeychainStore::new();
    match command {
        AuthCommands::SetKey { key } => {
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("API key must not be empty");
            }
            store.store(API_KEY_ENTRY, key)?;
            println!("Dust API key saved to keychain");
        }
        AuthCommands::Clear => {
            store.delete(API_KEY_ENTRY)?;
            println!("Dust API key removed from keychain");
        }
        AuthCommands::Status => {
            let env_config = Config::from_lookup(|key| std::env::var(key).ok())?;
            if env_config.dust.usable_api_key().is_some() {
                println!("API key: set via DUST_API_KEY");
            } else if store.exists(API_KEY_ENTRY) {
                println!("API key: stored in keychain");
            } else {
                println!("API key: not set (export DUST_API_KEY or run `dustlink auth set-key`)");
            }
        }
    }
    Ok(())
}
