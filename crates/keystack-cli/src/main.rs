//! keystack CLI tool.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "keystack")]
#[command(about = "Dependency-ordered infrastructure provisioning", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, env = "KEYSTACK_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// What happens to resources this run created when a node fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OnFailure {
    /// Leave them in place
    Halt,
    /// Delete them in reverse order
    Rollback,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnFailure::Halt => "halt",
            OnFailure::Rollback => "rollback",
        }
    }
}

/// Values available to `${...}` interpolation in topology files.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Custom variable, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", global = true)]
    pub vars: Vec<String>,

    /// Deployment stage
    #[arg(long, env = "KEYSTACK_STAGE", global = true)]
    pub stage: Option<String>,

    /// Target account id
    #[arg(long, env = "KEYSTACK_ACCOUNT", global = true)]
    pub account: Option<String>,

    /// Target region
    #[arg(long, env = "KEYSTACK_REGION", global = true)]
    pub region: Option<String>,
}

/// Flags shared by the commands that talk to the provider.
#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// State file of the local provider
    #[arg(long, env = "KEYSTACK_STATE", default_value = ".keystack/state.json")]
    pub state: PathBuf,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execution overrides; unset flags fall back to the topology `settings` block.
#[derive(Args, Debug, Clone, Default)]
pub struct ExecArgs {
    /// JSON secrets file; KEYSTACK_SECRET_* variables are used when absent
    #[arg(long, env = "KEYSTACK_SECRETS")]
    pub secrets: Option<PathBuf>,

    /// Failure policy, overriding the topology's `failure-policy`
    #[arg(long, value_enum, env = "KEYSTACK_ON_FAILURE")]
    pub on_failure: Option<OnFailure>,

    /// Run each dependency layer with this many concurrent workers
    #[arg(long, env = "KEYSTACK_WORKERS")]
    pub workers: Option<usize>,

    /// Attempts per provider call, including the first
    #[arg(long, env = "KEYSTACK_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a topology without touching any resource
    Validate {
        /// Path to the topology file
        #[arg(default_value = "keystack.kdl")]
        file: PathBuf,
    },
    /// Show the provisioning order
    Plan {
        /// Path to the topology file
        #[arg(default_value = "keystack.kdl")]
        file: PathBuf,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create or update every resource in dependency order
    Apply {
        /// Path to the topology file
        #[arg(default_value = "keystack.kdl")]
        file: PathBuf,
        #[command(flatten)]
        state: StateArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Delete every resource in reverse dependency order
    Destroy {
        /// Path to the topology file
        #[arg(default_value = "keystack.kdl")]
        file: PathBuf,
        #[command(flatten)]
        state: StateArgs,
        /// Attempts per provider call, including the first
        #[arg(long, env = "KEYSTACK_MAX_ATTEMPTS")]
        max_attempts: Option<u32>,
    },
    /// Show which resources exist and their outputs
    Status {
        /// Path to the topology file
        #[arg(default_value = "keystack.kdl")]
        file: PathBuf,
        #[command(flatten)]
        state: StateArgs,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let outcome = match cli.command {
        Commands::Validate { file } => commands::validate::run(&file, &cli.target),
        Commands::Plan { file, json } => commands::plan::run(&file, &cli.target, json),
        Commands::Apply { file, state, exec } => {
            commands::apply::run(&file, &cli.target, &state, &exec).await
        }
        Commands::Destroy {
            file,
            state,
            max_attempts,
        } => commands::destroy::run(&file, &cli.target, &state, max_attempts).await,
        Commands::Status { file, state } => {
            commands::status::run(&file, &cli.target, &state).await
        }
    };

    let code = match outcome {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            commands::SETUP_FAILURE.code()
        }
    };
    std::process::exit(code);
}
