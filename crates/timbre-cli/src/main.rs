use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use timbre_sync::Config;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "timbre", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the catalog database (default: ~/.local/share/timbre/timbre.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Admit content listed in a JSON Lines manifest
    ///
    /// Each line is an object with `content_hash`, `vector`, `size_bytes`,
    /// `location` and optional `tags`. Content whose hash is already
    /// catalogued is reported as a duplicate and left untouched. The
    /// embedding index is saved once the whole manifest is processed.
    Admit {
        /// Path to the manifest file
        manifest: PathBuf,
    },
    /// Find the assets most similar to a vector or to an existing asset
    Query {
        /// Comma-separated query vector
        #[arg(long, conflicts_with = "like", required_unless_present = "like")]
        vector: Option<String>,

        /// Id of an indexed asset to use as the query
        #[arg(long)]
        like: Option<String>,

        /// Number of results
        #[arg(short, default_value_t = 10)]
        k: usize,

        /// Only return assets carrying this tag (repeatable)
        #[arg(long = "tag", value_name = "TAG", requires = "vector")]
        tags: Vec<String>,
    },
    /// Remove assets from every store
    ///
    /// Candidates are selected by any combination of criteria. Without
    /// `--execute` the candidates are listed and nothing changes.
    Cleanup {
        /// Non-canonical members of duplicate groups
        #[arg(long)]
        duplicates: bool,

        /// Assets whose blob is missing from the blob store
        #[arg(long)]
        orphaned: bool,

        /// Assets admitted more than this many days ago
        #[arg(long, value_name = "DAYS")]
        older_than_days: Option<u32>,

        /// Perform the deletions
        #[arg(long)]
        execute: bool,
    },
    /// Keep the earliest asset of each duplicate group and remove the rest
    Dedupe {
        /// Perform the deletions
        #[arg(long)]
        execute: bool,
    },
    /// Show catalog, index and cache statistics
    Status,
    /// Check that the catalog, index and blob store agree
    Verify {
        /// Remove index entries that have no catalog row and blobs that no
        /// asset points at
        #[arg(long)]
        repair: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Create the config file with defaults
    Init,
    /// Print the config file path
    Path,
    /// Print an example config file
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_with_db_path(cli.db)?;

    twyg::setup(config.logging.clone())
        .map_err(|e| anyhow::anyhow!("Failed to set up logging: {e:?}"))?;

    match cli.command {
        Commands::Admit { manifest } => {
            commands::run_admit(&config, &manifest).await?;
        }
        Commands::Query {
            vector,
            like,
            k,
            tags,
        } => {
            commands::run_query(
                &config,
                vector.as_deref(),
                like.as_deref(),
                k,
                &tags,
                cli.json,
            )
            .await?;
        }
        Commands::Cleanup {
            duplicates,
            orphaned,
            older_than_days,
            execute,
        } => {
            let criteria = commands::cleanup::criteria(duplicates, orphaned, older_than_days);
            commands::run_cleanup(&config, criteria, execute, cli.json).await?;
        }
        Commands::Dedupe { execute } => {
            commands::run_dedupe(&config, execute, cli.json).await?;
        }
        Commands::Status => {
            commands::show_status(&config, cli.json).await?;
        }
        Commands::Verify { repair } => {
            commands::run_verify(&config, repair, cli.json).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show_config(&config)?,
            ConfigAction::Init => commands::config::init_config()?,
            ConfigAction::Path => commands::config::show_path(),
            ConfigAction::Example => commands::config::show_example(),
        },
    }

    Ok(())
}
