//! Caseport CLI - migrate test-management data from TestRail to Qase.

mod commands;
mod config;
mod progress;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

use crate::commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "caseport")]
#[command(version)]
#[command(about = "Migrate test-management data from TestRail to Qase")]
#[command(
    long_about = "Caseport copies users, projects, attachments, custom fields, configurations, \
milestones, suites, shared steps, test cases and runs from a TestRail instance into a Qase \
workspace. Stages run in dependency order; entities that fail are recorded and the rest \
carry on."
)]
#[command(after_long_help = r#"EXAMPLES
    Run a full migration:
        $ caseport run

    Skip attachments and runs:
        $ caseport run --skip attachments --skip runs

    Use a specific config file and report prefix:
        $ caseport --config ./acme.toml run --prefix acme

    Show the effective configuration:
        $ caseport config

    Generate shell completions:
        $ caseport completions bash > ~/.local/share/bash-completion/completions/caseport

CONFIGURATION
    Caseport reads configuration from:
      1. ~/.config/caseport/config.toml (or $XDG_CONFIG_HOME/caseport/config.toml)
      2. ./caseport.toml
      3. The file given with --config
      4. Environment variables (CASEPORT_ prefix, __ between section and key)
      5. .env file in current directory

ENVIRONMENT VARIABLES
    CASEPORT_TESTRAIL__HOST       TestRail instance URL
    CASEPORT_TESTRAIL__USER       TestRail user (email)
    CASEPORT_TESTRAIL__API_KEY    TestRail API key
    CASEPORT_QASE__TOKEN          Qase API token
    CASEPORT_QASE__SCIM_TOKEN     Qase SCIM token (enables user provisioning)
    CASEPORT_USERS__DEFAULT       Destination user id for unmatched users
"#)]
struct Cli {
    /// Configuration file (layered over the defaults)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration
    Run(RunArgs),
    /// Print the effective configuration (secrets redacted)
    Config,
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
    /// Generate man page(s)
    Man {
        /// Output directory for man pages (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Progress bars on a TTY, structured logs otherwise
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("caseport=info,caseport_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            commands::meta::handle_completions(*shell)?;
            return Ok(());
        }
        Commands::Man { output } => {
            commands::meta::handle_man(output.clone())?;
            return Ok(());
        }
        _ => {}
    }

    let config = config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run::handle_run(args, &config).await?,
        Commands::Config => commands::meta::handle_config(&config)?,
        Commands::Completions { .. } | Commands::Man { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use caseport::StageKind;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_skips() {
        let cli = Cli::try_parse_from([
            "caseport",
            "--config",
            "acme.toml",
            "run",
            "--skip",
            "attachments",
            "--skip",
            "shared-steps",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("acme.toml")));
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.skip, [StageKind::Attachments, StageKind::SharedSteps]);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Cli::try_parse_from(["caseport", "run", "--skip", "teleport"]).is_err());
    }
}
