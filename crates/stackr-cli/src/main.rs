mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{jobs::JobsSubcommand, lifecycle::Action, remote::RemoteSubcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "stackr",
    about = "Run, deploy and schedule docker compose stacks from one repository",
    version,
    propagate_version = true
)]
struct Cli {
    /// Repository root (default: nearest directory with .stackr.yaml)
    #[arg(long, global = true, env = "STACKR_REPO_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Verbose logging
    #[arg(long, global = true, short = 'D')]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold .stackr.yaml, .env and an example stack
    Init,

    /// List discovered stacks
    Stacks,

    /// Start stacks with the images already present
    Up {
        stacks: Vec<String>,
        #[arg(long)]
        all: bool,
    },

    /// Pull images and recreate stacks
    Update {
        stacks: Vec<String>,
        #[arg(long)]
        all: bool,
        /// Deploy this image tag (single stack only)
        #[arg(long)]
        tag: Option<String>,
    },

    /// Stop stacks
    Down {
        stacks: Vec<String>,
        #[arg(long)]
        all: bool,
    },

    /// Copy stack configuration and pool volumes into the backup directory
    Backup {
        stacks: Vec<String>,
        #[arg(long)]
        all: bool,
    },

    /// Show the variables a stack needs and add placeholders for missing ones
    GetVars {
        stacks: Vec<String>,
        #[arg(long)]
        all: bool,
    },

    /// Run docker compose with the stack's environment
    Compose {
        stack: String,
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Run a command with the stack's environment in its directory
    Exec {
        stack: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Set a stack's image tag and update it, restoring .env on failure
    Deploy {
        stack: String,
        #[arg(long)]
        tag: String,
        /// Variable to set (default: <STACK>_IMAGE_TAG)
        #[arg(long)]
        tag_var: Option<String>,
    },

    /// Scheduled jobs declared with stackr.cron.* labels
    Jobs {
        #[command(subcommand)]
        subcommand: JobsSubcommand,
    },

    /// Remote stacks backed by a git repository
    Remote {
        #[command(subcommand)]
        subcommand: RemoteSubcommand,
    },

    /// Run the scheduler, stack watcher and deploy API until interrupted
    Daemon,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        match &cli.command {
            Commands::Daemon => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = dispatch(cli.root.as_deref(), cli.command, cli.json);

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn dispatch(explicit_root: Option<&Path>, command: Commands, json: bool) -> anyhow::Result<()> {
    let root = &root::resolve_root(explicit_root);

    match command {
        Commands::Init => cmd::init::run(root),
        Commands::Stacks => cmd::stacks::run(root, json),
        Commands::Up { stacks, all } => cmd::lifecycle::run(root, Action::Up, &stacks, all, json),
        Commands::Update { stacks, all, tag } => match tag {
            Some(tag) => cmd::lifecycle::update_to_tag(root, &stacks, all, &tag, json),
            None => cmd::lifecycle::run(root, Action::Update, &stacks, all, json),
        },
        Commands::Down { stacks, all } => cmd::lifecycle::run(root, Action::Down, &stacks, all, json),
        Commands::Backup { stacks, all } => cmd::lifecycle::backup(root, &stacks, all, json),
        Commands::GetVars { stacks, all } => cmd::lifecycle::get_vars(root, &stacks, all, json),
        Commands::Compose { stack, args } => cmd::compose::compose(root, &stack, &args),
        Commands::Exec { stack, command } => cmd::compose::exec(root, &stack, &command),
        Commands::Deploy {
            stack,
            tag,
            tag_var,
        } => cmd::deploy::run(root, &stack, &tag, tag_var.as_deref(), json),
        Commands::Jobs { subcommand } => cmd::jobs::run(root, subcommand, json),
        Commands::Remote { subcommand } => cmd::remote::run(root, subcommand, json),
        // The daemon has its own default root instead of searching upward.
        Commands::Daemon => cmd::daemon::run(explicit_root),
    }
}
