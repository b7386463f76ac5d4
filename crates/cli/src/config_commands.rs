use {anyhow::Result, clap::Subcommand};

use switchboard_config::{Severity, SwitchboardConfig, config_dir, to_toml, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (file plus environment overrides).
    Show,
    /// Validate the configuration and report errors/warnings.
    Check,
    /// Print the user config directory.
    Path,
}

pub fn handle_config(config: &SwitchboardConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", to_toml(config)?);
            Ok(())
        },
        ConfigAction::Check => check(config),
        ConfigAction::Path => {
            match config_dir() {
                Some(dir) => println!("{}", dir.display()),
                None => eprintln!("no home directory, only ./switchboard.* is searched"),
            }
            Ok(())
        },
    }
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &SwitchboardConfig) -> Result<()> {
    let result = validate(config);

    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
