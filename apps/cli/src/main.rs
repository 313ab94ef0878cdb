//! Relayman CLI - Command-line channel forwarding manager
//!
//! Runs forwarding tasks in the foreground and controls them from another shell.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relayman_core::{BotApiTransport, Connections};
use relayman_types::{AuthMethod, ChannelKind, ForwardMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Relayman - Channel Forwarding Manager
#[derive(Parser)]
#[command(name = "relayman")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Relayman
    #[arg(long, env = "RELAYMAN_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Bot token for the bot account connection
    #[arg(long, env = "RELAYMAN_BOT_TOKEN", hide_env_values = true, global = true)]
    bot_token: Option<String>,

    /// Bot API endpoint
    #[arg(
        long,
        env = "RELAYMAN_BOT_API_URL",
        default_value = relayman_core::engine::DEFAULT_BASE_URL,
        global = true
    )]
    bot_api_url: String,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume RUNNING tasks and keep forwarding until Ctrl-C
    Run,

    /// Create a forwarding task and keep forwarding until Ctrl-C
    Start {
        /// Source channel (@username or numeric id)
        #[arg(allow_negative_numbers = true)]
        source: String,

        /// Destination channel (@username or numeric id)
        #[arg(allow_negative_numbers = true)]
        dest: String,

        /// Connection that executes the task (user_account or bot_account)
        #[arg(short, long, default_value = "bot_account")]
        auth: AuthMethod,

        /// complete: forward the backlog once; live: forward new messages
        #[arg(short, long, default_value = "complete")]
        mode: ForwardMode,

        /// Owner id recorded on the task
        #[arg(long, default_value_t = 0)]
        owner: i64,
    },

    /// List tasks
    List {
        /// Filter by owner id
        #[arg(long)]
        owner: Option<i64>,

        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show task progress and error log
    Status {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Pause a task
    Pause {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Resume a paused task
    Resume {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Stop a task for good
    Stop {
        /// Task ID (or unique prefix)
        id: String,
    },

    /// Delete a task
    Delete {
        /// Task ID (or unique prefix)
        id: String,

        /// Also erase the task record
        #[arg(long)]
        purge: bool,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage saved source and destination channels
    Channels {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ChannelAction {
    /// Save a channel (kind is `source` or `dest`)
    Add {
        kind: ChannelKind,

        /// Channel (@username or numeric id)
        #[arg(allow_negative_numbers = true)]
        channel: String,

        /// Owner id the channel is saved for
        #[arg(long, default_value_t = 0)]
        owner: i64,
    },

    /// Forget a saved channel
    Remove {
        kind: ChannelKind,

        /// Channel (@username or numeric id)
        #[arg(allow_negative_numbers = true)]
        channel: String,

        /// Owner id the channel is saved for
        #[arg(long, default_value_t = 0)]
        owner: i64,
    },

    /// List saved channels
    List {
        /// Only this kind
        #[arg(short, long)]
        kind: Option<ChannelKind>,

        /// Owner id the channels are saved for
        #[arg(long, default_value_t = 0)]
        owner: i64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value (e.g. `max_retries`, `bot_account.base_delay`)
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

impl Cli {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("relayman"))
                .unwrap_or_else(|| PathBuf::from(".relayman"))
        })
    }

    /// Connections available to this process
    fn connections(&self) -> Result<Connections> {
        let mut connections = Connections::new();
        if let Some(token) = &self.bot_token {
            let transport = BotApiTransport::with_base_url(token, &self.bot_api_url)?;
            connections = connections.with_bot_account(Arc::new(transport));
        }
        Ok(connections)
    }
}

/// Initialize logging to stderr and optionally to a rolling file.
/// The returned guard flushes the file writer on drop.
fn init_logging(
    default_level: &str,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},sqlx=warn,reqwest=warn,hyper=warn"))
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relayman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let serving = matches!(cli.command, Commands::Run | Commands::Start { .. });
    let default_level = match (cli.verbose, serving) {
        (true, _) => "debug",
        (false, true) => "info",
        (false, false) => "warn",
    };
    let _log_guard = init_logging(default_level, cli.log_dir.as_deref());

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(
            shell,
            &mut Cli::command(),
            "relayman",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    // Only serving commands hold live connections; the others just
    // record transitions for the serving process to pick up
    let connections = if serving {
        cli.connections()?
    } else {
        Connections::new()
    };
    let core = relayman_core::RelaymanCore::new(cli.data_dir(), connections).await?;

    // Execute command
    match cli.command {
        Commands::Run => commands::run_daemon(&core, cli.output).await?,

        Commands::Start {
            source,
            dest,
            auth,
            mode,
            owner,
        } => {
            commands::start_task(&core, &source, &dest, auth, mode, owner, cli.output).await?
        }

        Commands::List { owner, status } => {
            commands::list_tasks(&core, owner, status, cli.output).await?
        }

        Commands::Status { id } => commands::show_status(&core, &id, cli.output).await?,

        Commands::Pause { id } => commands::pause_task(&core, &id, cli.output).await?,

        Commands::Resume { id } => commands::resume_task(&core, &id, cli.output).await?,

        Commands::Stop { id } => commands::stop_task(&core, &id, cli.output).await?,

        Commands::Delete { id, purge, yes } => {
            commands::delete_task(&core, &id, purge, yes, cli.output).await?
        }

        Commands::Channels { action } => {
            commands::channel_action(&core, action, cli.output).await?
        }

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
