use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use custody::cli::{Cli, Commands};

/// Environment variable holding the log filter directives
const LOG_ENV: &str = "CUSTODY_LOG";

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "custody=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> Result<()> {
    // Reset SIGPIPE to default behavior (terminate silently) for proper Unix piping.
    // Without this, piping to `head`, `grep -q`, etc. causes a panic on broken pipe.
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .build(),
        )
    }))?;

    let cli = Cli::parse();
    let global = cli.global;
    init_tracing(global.verbose);

    match cli.command {
        Commands::Init(args) => custody::cli::commands::init::run(args),
        Commands::Index(args) => custody::cli::commands::index::run(args, &global),
        Commands::Cache(cmd) => custody::cli::commands::cache::run(cmd, &global),
        Commands::List(args) => custody::cli::commands::list::run(args, &global),
        Commands::Replay(args) => custody::cli::commands::replay::run(args, &global),
        Commands::Select(args) => custody::cli::commands::select::run(args, &global),
    }
}
