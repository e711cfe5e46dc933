use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;

use crate::Cli;
use crate::config::Config;

const BIN_NAME: &str = "caseport";

fn write_completions(shell: clap_complete::Shell, out: &mut impl Write) {
    clap_complete::generate(shell, &mut Cli::command(), BIN_NAME, out);
}

/// Write the top-level page to `out`, or one page per command into `dir`.
fn write_man_pages(dir: Option<&Path>, out: &mut impl Write) -> std::io::Result<()> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            clap_mangen::generate_to(Cli::command(), dir)?;
            writeln!(out, "Generated man pages in: {}", dir.display())
        }
        None => clap_mangen::Man::new(Cli::command()).render(out),
    }
}

fn effective_config(config: &Config) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&config.redacted())
}

pub(crate) fn handle_completions(
    shell: clap_complete::Shell,
) -> Result<(), Box<dyn std::error::Error>> {
    write_completions(shell, &mut std::io::stdout().lock());
    Ok(())
}

pub(crate) fn handle_man(output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    write_man_pages(output.as_deref(), &mut std::io::stdout().lock())?;
    Ok(())
}

/// Print the merged configuration with secrets redacted.
pub(crate) fn handle_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", effective_config(config)?);
    match Config::default_config_path() {
        Some(path) => eprintln!("Config file: {}", path.display()),
        None => eprintln!("Config file: (no config directory)"),
    }
    if let Err(e) = config.validate() {
        eprintln!("{e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_offer_stage_names_for_skip() {
        let mut out = Vec::new();
        write_completions(clap_complete::Shell::Bash, &mut out);
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("shared-steps"));
    }

    #[test]
    fn man_directory_gets_a_page_per_subcommand() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();

        write_man_pages(Some(dir.path()), &mut out).unwrap();

        assert!(dir.path().join("caseport.1").exists());
        assert!(dir.path().join("caseport-run.1").exists());
        assert!(String::from_utf8(out).unwrap().starts_with("Generated man pages"));
    }

    #[test]
    fn effective_config_redacts_tokens() {
        let mut config = Config::default();
        config.qase.token = Some("qase-secret".to_string());
        config.testrail.host = Some("https://tr.example.com".to_string());

        let out = effective_config(&config).unwrap();

        assert!(!out.contains("qase-secret"));
        assert!(out.contains("https://tr.example.com"));
    }
}
