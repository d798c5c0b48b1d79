use std::path::PathBuf;

use {
    anyhow::{Result, bail},
    bambooclaw_config::{BambooConfig, Severity, ValidationResult, load_config, validate},
    clap::Subcommand,
};

use crate::paint::{Tone, paint};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Validate {
        /// File to check instead of the discovered one.
        path: Option<PathBuf>,
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the path of the config file in use.
    Path,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Validate { path, verbose } => {
            let result = validate(path.as_deref());
            print_diagnostics(&result, verbose);
            if result.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        },
        ConfigAction::Path => {
            println!("{}", bambooclaw_config::find_or_default_config_path().display());
            Ok(())
        },
    }
}

/// Validate the discovered config file and load it. Nothing is applied when
/// validation reports an error.
pub fn load_validated() -> Result<BambooConfig> {
    let result = validate(None);
    if result.has_errors() {
        print_diagnostics(&result, false);
    }
    load_checked(&result)
}

fn load_checked(result: &ValidationResult) -> Result<BambooConfig> {
    if result.has_errors() {
        bail!(
            "config has {} error(s); run `bambooclaw config validate` for details",
            result.count(Severity::Error)
        );
    }
    match &result.config_path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(BambooConfig::default()),
    }
}

fn print_diagnostics(result: &ValidationResult, verbose: bool) {
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

        let label = match d.severity {
            Severity::Error => paint(Tone::Bad, "error"),
            Severity::Warning => paint(Tone::Caution, "warning"),
            Severity::Info => paint(Tone::Note, "info"),
        };
        if d.path.is_empty() {
            eprintln!("  {label} [{}] {}", d.category, d.message);
        } else {
            eprintln!("  {label} [{}] {}: {}", d.category, d.path, d.message);
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
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn valid_file_loads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 9100\n").unwrap();

        let result = validate(Some(&path));
        let config = load_checked(&result).unwrap();
        assert_eq!(config.gateway.port, 9100);
    }

    #[test]
    fn invalid_file_is_not_applied() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway\nport = 9100\n").unwrap();

        let result = validate(Some(&path));
        assert!(result.has_errors());
        let err = load_checked(&result).unwrap_err();
        assert!(err.to_string().contains("config validate"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let result = ValidationResult::default();
        let config = load_checked(&result).unwrap();
        assert_eq!(config.gateway.port, BambooConfig::default().gateway.port);
    }
}
