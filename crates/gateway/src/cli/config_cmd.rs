//! `agently config` subcommands.

use agently_domain::config::{Config, ConfigSeverity};

/// Validate; returns false when any error-severity issue exists.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => eprintln!("warning: {issue}"),
            ConfigSeverity::Error => eprintln!("error: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors == 0 {
        eprintln!("configuration ok ({} warning(s))", issues.len());
        true
    } else {
        eprintln!("configuration invalid: {errors} error(s)");
        false
    }
}

/// Print the resolved configuration as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("cannot render config: {e}"),
    }
    println!("# resolved paths");
    println!("# runtime_root = {}", config.runtime_root().display());
    println!("# state_path   = {}", config.state_path().display());
    println!("# db_path      = {}", config.db_path().display());
}
