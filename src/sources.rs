use anyhow::Result;

use crate::config::Config;
use crate::traits::SourceRegistry;

/// `corpus sources`: one line per configured source.
pub fn list_sources(config: &Config) -> Result<()> {
    let registry = SourceRegistry::from_config(config)?;
    let policy = config.policy();

    println!(
        "{:<20} {:<12} {:>8} {:>8}   DESCRIPTION",
        "SOURCE", "KIND", "CADENCE", "QUOTA"
    );
    for source in registry.sources() {
        let quota = match policy.quota_for(source.name()) {
            0 => "-".to_string(),
            n => n.to_string(),
        };
        println!(
            "{:<20} {:<12} {:>7}d {:>8}   {}",
            source.name(),
            source.kind(),
            policy.cadence_for(source.name()),
            quota,
            source.description()
        );
    }

    if registry.is_empty() {
        println!("(no sources configured)");
    }
    Ok(())
}
