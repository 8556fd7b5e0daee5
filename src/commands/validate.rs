//! Manifest validation command

use anyhow::Result;
use tracing::info;

use stratforge::plugin::manifest::PluginManifest;

pub fn run(manifest_path: String) -> Result<()> {
    let manifest = PluginManifest::from_file(&manifest_path)?;

    info!("Manifest OK: {}", manifest_path);
    println!("Plugin:      {} v{}", manifest.name, manifest.version);
    println!("Kind:        {:?}", manifest.kind);
    println!("Entry:       {}", manifest.entry);
    println!("API version: {}", manifest.api_version);
    println!(
        "Symbols:     {}",
        manifest
            .host_params
            .symbols
            .iter()
            .map(|s| {
                if s.primary {
                    format!("{}* ({})", s.symbol, s.timeframe())
                } else {
                    format!("{} ({})", s.symbol, s.timeframe())
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(())
}
