//! `custody init` command - Initialize a new custody workspace

use console::style;
use miette::{IntoDiagnostic, Result};

use crate::core::project::{Project, ProjectError, WORKSPACE_DIR};

#[derive(clap::Args, Debug)]
pub struct InitArgs {
    /// Directory to initialize (default: current directory)
    #[arg(default_value = ".")]
    pub path: std::path::PathBuf,

    /// Rewrite the default config even if .custody/ already exists
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: InitArgs) -> Result<()> {
    let path = if args.path.as_os_str() == "." {
        std::env::current_dir().into_diagnostic()?
    } else {
        args.path.clone()
    };

    let project = if args.force {
        Project::init_force(&path)
    } else {
        Project::init(&path)
    };

    match project {
        Ok(project) => {
            println!(
                "{} Initialized custody workspace at {}",
                style("✓").green(),
                style(project.root().display()).cyan()
            );
            println!();
            println!("Created:");
            println!("  {}/config.yaml", WORKSPACE_DIR);
            println!("  {}/.gitignore", WORKSPACE_DIR);
            println!();
            println!("Next steps:");
            println!(
                "  {} Build snapshots from a backend export",
                style("custody index --remote <DIR>").yellow()
            );
            println!(
                "  {} Show the merged working set",
                style("custody list").yellow()
            );
            Ok(())
        }
        Err(ProjectError::AlreadyExists(path)) => {
            println!(
                "{} custody workspace already exists at {}",
                style("!").yellow(),
                style(path.display()).cyan()
            );
            println!();
            println!(
                "Use {} to reinitialize",
                style("custody init --force").yellow()
            );
            Ok(())
        }
        Err(e) => Err(miette::miette!("{}", e)),
    }
}
