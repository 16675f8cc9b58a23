use anyhow::Result;
use timbre_sync::config::{self, Config};

/// Show the current effective configuration.
pub fn show_config(config: &Config) -> Result<()> {
    let path = config::config_file_path();

    println!("Current Configuration");
    println!("=====================\n");
    println!("Config file: {}", path.display());
    println!(
        "File exists: {}\n",
        if path.exists() { "yes" } else { "no (using defaults)" }
    );
    println!("  database_path: {}", config.database_path.display());
    println!("  index_path: {}", config.index_path.display());
    println!("  blob_root: {}", config.blob_root.display());
    println!("  embedding_dimension: {}", config.embedding_dimension);
    println!("  metric: {}", config.metric);
    println!("  busy_policy: {:?}", config.busy_policy);
    match config.rebuild_timeout_secs {
        Some(secs) => println!("  rebuild_timeout_secs: {secs}"),
        None => println!("  rebuild_timeout_secs: <none>"),
    }
    println!("  cache_ttl_secs: {}", config.cache_ttl_secs);
    println!("  logging: {:?}", config.logging);

    println!("\nPriority: CLI args > ENV vars (TIMBRE_*) > Config file > Defaults");
    Ok(())
}

/// Initialize config file with defaults.
pub fn init_config() -> Result<()> {
    let created = config::ensure_config_file()?;
    let path = config::config_file_path();

    if created {
        println!("✓ Created config file: {}", path.display());
        println!("\nEdit this file to configure timbre.");
    } else {
        println!("Config file already exists: {}", path.display());
    }
    Ok(())
}

pub fn show_path() {
    println!("{}", config::config_file_path().display());
}

pub fn show_example() {
    print!("{}", config::example_config());
}
