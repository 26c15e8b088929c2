use anyhow::Result;

use crate::config::Config;

pub fn list_sources(config: &Config) -> Result<()> {
    let sources = config.resolve_sources()?;

    println!(
        "{:<14} {:<12} {:<18} {:<28} ENABLED",
        "SOURCE", "LABEL", "ENDPOINT", "JOIN KEY"
    );
    for source in &sources {
        let descriptor = source.descriptor();
        println!(
            "{:<14} {:<12} {:<18} {:<28} {}",
            source.name(),
            descriptor.label(),
            descriptor.endpoint,
            descriptor.join_key.describe(),
            source.enabled
        );
    }

    Ok(())
}
