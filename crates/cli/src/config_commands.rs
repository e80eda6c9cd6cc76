use {
    anyhow::Result,
    clap::Subcommand,
    std::path::{Path, PathBuf},
};

use chatrelay_config::{
    RelayConfig,
    validate::{self, Severity},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration (file, env overrides and defaults) as TOML.
    Show,
    /// Print where config and data live.
    Paths,
}

pub fn handle_config(action: ConfigAction, config_path: Option<&Path>, config: &RelayConfig) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(config_path, verbose),
        ConfigAction::Show => {
            let mut shown = config.clone();
            if shown.gateway.api_key.is_some() {
                shown.gateway.api_key = Some(secrecy::Secret::new("********".into()));
            }
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        },
        ConfigAction::Paths => {
            let config_file = config_path
                .map(Path::to_path_buf)
                .or_else(chatrelay_config::find_config_file);
            println!(
                "config file: {}",
                config_file.map_or_else(|| "(none, using defaults)".into(), |p| p.display().to_string())
            );
            println!(
                "config dir:  {}",
                chatrelay_config::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .display()
            );
            println!("data dir:    {}", chatrelay_config::data_dir().display());
            println!("database:    {}", chatrelay_config::resolve_database_url(config));
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate::validate(config_path);

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
            Severity::Info => CYAN,
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{}{RESET} {}", d.severity, d.message);
        } else {
            eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
