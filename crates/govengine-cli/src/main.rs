use clap::{Parser, Subcommand};
use govengine_cli::cmd::{
    self, action::InitiateArgs, element::ElementSubcommand, parse_kv, process::ProcessSubcommand,
};
use govengine_cli::root;
use govengine_core::types::EngineActionStatus;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "govengine",
    about = "Governance action engine: initiate, dispatch and track governance actions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .govengine/)
    #[arg(long, global = true, env = "GOVENGINE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// User id the request is made on behalf of (default: $USER)
    #[arg(long, global = true, env = "GOVENGINE_USER")]
    user: Option<String>,

    /// Debug logging
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a governance engine project in the current directory
    Init,

    /// Request a new governance action
    Initiate {
        /// Unique name for this request
        qualified_name: String,

        /// Request type the governance service is registered under
        #[arg(long)]
        request_type: String,

        /// Element the action works on (repeatable)
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Element that caused the request (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Request parameter as KEY=VALUE (repeatable)
        #[arg(long = "param", value_parser = parse_kv)]
        params: Vec<(String, String)>,

        /// Delay the start by this many seconds
        #[arg(long)]
        start_in_secs: Option<u64>,

        #[arg(long)]
        display_name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Print the status of an engine action
    Status { guid: String },

    /// Show an engine action in full
    Show { guid: String },

    /// List engine actions
    List {
        /// Only actions in this status (repeatable)
        #[arg(long = "status", value_parser = parse_status)]
        statuses: Vec<EngineActionStatus>,
    },

    /// Approve a requested action so the engine may dispatch it
    Approve { guid: String },

    /// Cancel an action; a running handler is told to stop
    Cancel { guid: String },

    /// Run the engine until interrupted
    Run {
        /// Dispatch what is ready, wait for it to finish, then exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect the process definition
    Process {
        #[command(subcommand)]
        subcommand: ProcessSubcommand,
    },

    /// Manage metadata elements
    Element {
        #[command(subcommand)]
        subcommand: ElementSubcommand,
    },
}

fn parse_status(s: &str) -> Result<EngineActionStatus, String> {
    s.parse().map_err(|e: govengine_core::GovError| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => tracing::Level::DEBUG,
        (Commands::Run { .. }, false) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let user = cli
        .user
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "admin".to_string());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Initiate {
            qualified_name,
            request_type,
            targets,
            sources,
            params,
            start_in_secs,
            display_name,
            description,
        } => {
            let args = InitiateArgs {
                qualified_name,
                request_type,
                targets,
                sources,
                params,
                start_in_secs,
                display_name,
                description,
            };
            cmd::action::initiate(&root, &user, args, cli.json)
        }
        Commands::Status { guid } => cmd::action::status(&root, &guid, cli.json),
        Commands::Show { guid } => cmd::action::show(&root, &guid, cli.json),
        Commands::List { statuses } => cmd::action::list(&root, &statuses, cli.json),
        Commands::Approve { guid } => cmd::action::approve(&root, &user, &guid, cli.json),
        Commands::Cancel { guid } => cmd::action::cancel(&root, &user, &guid, cli.json),
        Commands::Run { once } => cmd::run::run(&root, once, cli.json),
        Commands::Process { subcommand } => cmd::process::run(&root, subcommand, cli.json),
        Commands::Element { subcommand } => cmd::element::run(&root, &user, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
