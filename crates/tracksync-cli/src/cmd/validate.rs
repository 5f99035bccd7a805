use std::path::Path;

use anyhow::{bail, Context, Result};
use tracksync_core::config::{Config, WarnLevel};

use crate::output::print_json;

pub fn run(config_path: &Path, json: bool) -> Result<()> {
    let data = std::fs::read_to_string(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let config = Config::from_yaml(&data)
        .with_context(|| format!("parsing {}", config_path.display()))?;
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "valid": errors == 0,
            "warnings": warnings,
        }))?;
    } else if warnings.is_empty() {
        println!(
            "{}: ok ({} trackers, {} triggers, {} jobs)",
            config_path.display(),
            config.trackers.len(),
            config.triggers.len(),
            config.jobs.len()
        );
    } else {
        for w in &warnings {
            let tag = match w.level {
                WarnLevel::Error => "error",
                WarnLevel::Warning => "warning",
            };
            println!("{tag}: {}", w.message);
        }
    }

    if errors > 0 {
        bail!("{errors} configuration error(s)");
    }
    Ok(())
}
