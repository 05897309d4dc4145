//! TierMem CLI
//!
//! The `tiermem` command drives a tiered tagged memory stored in a directory
//! (`memory.json` + `context_keys.json`).
//!
//! ## Commands
//!
//! - `store` / `get` / `delete`: single-key operations
//! - `query` / `summary`: ranked search over the directory
//! - `cleanup` / `optimize` / `compact` / `budget`: lifecycle sweeps
//! - `backup` / `recover` / `verify`: persistence safety (`recover` and
//!   `verify` also run when the files are too damaged to open)
//! - `page` / `prepare` / `paging-prompt`: LLM context management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use tiermem_core::{AgentState, Layer, MemoryConfig, QueryCriteria, SharedMemory, TaggedMemory};

#[derive(Parser)]
#[command(name = "tiermem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tiered tagged memory for LLM agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Storage directory holding the memory files
    #[arg(short, long, global = true, default_value = ".tiermem")]
    dir: PathBuf,

    /// TOML config file; overrides --dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value (read from stdin when DATA is omitted)
    Store {
        name: String,
        data: Option<String>,

        #[arg(short, long, default_value = "working")]
        layer: Layer,

        #[arg(short, long, default_value = "50")]
        importance: u8,

        /// Compress and store on disk at importance 70
        #[arg(long, conflicts_with_all = ["layer", "importance"])]
        disk: bool,
    },

    /// Print a stored value
    Get { name: String },

    /// Delete a key and its value
    Delete { name: String },

    /// Ranked search, printed as JSON
    Query {
        #[command(flatten)]
        filter: QueryArgs,
    },

    /// Ranked search, printed as a text report
    Summary {
        #[command(flatten)]
        filter: QueryArgs,
    },

    /// Size and usage counters
    Stats,

    /// Sweep keys idle longer than the threshold
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,

        /// Archive instead of deleting
        #[arg(long)]
        archive: bool,
    },

    /// Expiry, duplicate and orphan cleanup
    Optimize {
        #[arg(long)]
        aggressive: bool,
    },

    /// Archive stale keys, then back up, defragment and recompress
    Compact {
        #[arg(long)]
        aggressive: bool,
    },

    /// Bring working and disk layers under the configured size budgets
    Budget,

    /// Copy both files into the backup directory
    Backup,

    /// Restore both files from the newest valid backups
    Recover,

    /// Check file validity and key retrievability
    Verify,

    /// Apply paging directives from LLM output (stdin when FILE is omitted)
    Page { file: Option<PathBuf> },

    /// Render the context block for an LLM prompt
    Prepare {
        #[arg(short, long, default_value = "thinking")]
        state: AgentState,

        #[arg(long, default_value = "4096")]
        max_tokens: usize,
    },

    /// Render the prompt asking an LLM for paging directives
    PagingPrompt {
        #[arg(short, long, default_value = "paging")]
        state: AgentState,

        #[arg(long, default_value = "262144")]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Glob over key names
    #[arg(short, long, default_value = "")]
    pattern: String,

    #[arg(short, long)]
    layer: Option<Layer>,

    #[arg(long, default_value = "0")]
    min_importance: u8,

    #[arg(long, default_value = "100")]
    max_importance: u8,

    #[arg(short = 'n', long, default_value = "20")]
    limit: usize,
}

impl QueryArgs {
    fn criteria(&self) -> QueryCriteria {
        let mut criteria = QueryCriteria::all()
            .with_pattern(&self.pattern)
            .with_importance(self.min_importance, self.max_importance)
            .with_limit(self.limit);
        criteria.layer = self.layer;
        criteria
    }
}

fn load_config(dir: &Path, config: Option<&Path>) -> Result<MemoryConfig> {
    match config {
        Some(path) => MemoryConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(MemoryConfig::in_dir(dir)),
    }
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read stdin")?;
            Ok(text)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tiermem_core::init_tracing(cli.json, level);

    let config = load_config(&cli.dir, cli.config.as_deref())?;
    dispatch(&config, cli.command).await
}

/// Route `recover` and `verify` around [`TaggedMemory::open`], which fails
/// on the damaged files they exist to handle; open for everything else.
async fn dispatch(config: &MemoryConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Recover => {
            let (memory, report) = TaggedMemory::recover(config.clone())
                .context("Failed to recover memory from backups")?;
            info!(keys = memory.keys().len(), "recovered");
            print_json(&report)
        }
        Commands::Verify => {
            let report = TaggedMemory::verify_files(config)?;
            print_json(&report)?;
            if !report.is_valid() {
                anyhow::bail!("memory verification failed");
            }
            Ok(())
        }
        command => {
            let memory = TaggedMemory::open(config.clone()).with_context(|| {
                format!("Failed to open memory at {}", config.memory_file.display())
            })?;
            let shared = SharedMemory::new(memory);
            run(&shared, command).await
        }
    }
}

async fn run(shared: &SharedMemory, command: Commands) -> Result<()> {
    let mut memory = shared.lock().await;
    match command {
        Commands::Store {
            name,
            data,
            layer,
            importance,
            disk,
        } => {
            let data = match data {
                Some(data) => data,
                None => read_input(None)?,
            };
            if disk {
                memory.disk_store(&name, &data, true)?;
            } else {
                memory.store(&name, &data, layer, importance)?;
            }
            memory.save().context("Failed to save memory")?;
            info!(key = %name, "stored");
        }
        Commands::Get { name } => {
            let data = memory.retrieve(&name)?;
            memory.save().context("Failed to save memory")?;
            println!("{data}");
        }
        Commands::Delete { name } => {
            memory.delete(&name)?;
            memory.save().context("Failed to save memory")?;
            info!(key = %name, "deleted");
        }
        Commands::Query { filter } => {
            let results = memory.query(&filter.criteria(), 0)?;
            print_json(&results)?;
        }
        Commands::Summary { filter } => {
            print!("{}", memory.query_summary(&filter.criteria())?);
        }
        Commands::Stats => {
            let stats = memory.stats();
            stats.flush();
            print_json(&stats)?;
        }
        Commands::Cleanup { days, archive } => {
            let affected = memory.cleanup_expired(days * 86_400, archive)?;
            memory.save().context("Failed to save memory")?;
            println!("{affected} keys {}", if archive { "archived" } else { "deleted" });
        }
        Commands::Optimize { aggressive } => {
            let report = memory.optimize_storage(aggressive)?;
            memory.save().context("Failed to save memory")?;
            print_json(&report)?;
        }
        Commands::Compact { aggressive } => {
            let archived = memory.compact(aggressive)?;
            let report = memory.disk_compact()?;
            info!(archived, "compaction finished");
            print_json(&report)?;
        }
        Commands::Budget => {
            let report = memory.enforce_budgets()?;
            memory.save().context("Failed to save memory")?;
            print_json(&report)?;
        }
        Commands::Backup => print_json(&memory.disk_backup()?)?,
        Commands::Recover => print_json(&memory.recover_from_backup()?)?,
        Commands::Verify => {
            let report = memory.disk_verify()?;
            print_json(&report)?;
            if !report.is_valid() {
                anyhow::bail!("memory verification failed");
            }
        }
        Commands::Page { file } => {
            let text = read_input(file.as_deref())?;
            let report = memory.process_directives(&text);
            memory.save().context("Failed to save memory")?;
            print_json(&report)?;
        }
        Commands::Prepare { state, max_tokens } => {
            print!("{}", memory.context_window_prepare_llm(state, max_tokens)?);
        }
        Commands::PagingPrompt { state, limit } => {
            print!("{}", memory.request_paging(state, limit)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_store_with_layer_and_importance() {
        let cli = Cli::try_parse_from([
            "tiermem", "--dir", "/tmp/m", "store", "notes", "hello", "-l", "disk", "-i", "75",
        ])
        .unwrap();
        assert_eq!(cli.dir, PathBuf::from("/tmp/m"));
        match cli.command {
            Commands::Store {
                name,
                data,
                layer,
                importance,
                disk,
            } => {
                assert_eq!(name, "notes");
                assert_eq!(data.as_deref(), Some("hello"));
                assert_eq!(layer, Layer::Disk);
                assert_eq!(importance, 75);
                assert!(!disk);
            }
            _ => panic!("expected store"),
        }
    }

    #[test]
    fn rejects_unknown_state() {
        assert!(Cli::try_parse_from(["tiermem", "prepare", "--state", "dreaming"]).is_err());
        assert!(Cli::try_parse_from(["tiermem", "prepare", "--state", "EXECUTING"]).is_ok());
    }

    #[test]
    fn query_args_build_criteria() {
        let cli = Cli::try_parse_from([
            "tiermem", "query", "-p", "task_*", "-l", "working", "--min-importance", "40", "-n", "5",
        ])
        .unwrap();
        let Commands::Query { filter } = cli.command else {
            panic!("expected query");
        };
        let criteria = filter.criteria();
        assert_eq!(criteria.pattern, "task_*");
        assert_eq!(criteria.layer, Some(Layer::Working));
        assert_eq!(criteria.min_importance, 40);
        assert_eq!(criteria.max_results, Some(5));
    }

    #[test]
    fn config_file_overrides_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiermem.toml");
        std::fs::write(&path, "memory_file = \"/data/m.json\"\nmax_backups = 3\n").unwrap();

        let config = load_config(Path::new("/ignored"), Some(&path)).unwrap();
        assert_eq!(config.memory_file, PathBuf::from("/data/m.json"));
        assert_eq!(config.max_backups, 3);

        let config = load_config(dir.path(), None).unwrap();
        assert_eq!(config.memory_file, dir.path().join("memory.json"));
    }

    #[tokio::test]
    async fn store_then_get_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::in_dir(dir.path());

        let shared = SharedMemory::new(TaggedMemory::open(config.clone()).unwrap());
        run(
            &shared,
            Commands::Store {
                name: "plan".into(),
                data: Some("ship it".into()),
                layer: Layer::Disk,
                importance: 60,
                disk: false,
            },
        )
        .await
        .unwrap();

        let mut reopened = TaggedMemory::open(config).unwrap();
        assert_eq!(reopened.retrieve("plan").unwrap(), "ship it");
        assert_eq!(reopened.key("plan").unwrap().layer, Layer::Disk);
    }

    #[tokio::test]
    async fn recover_works_when_memory_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::in_dir(dir.path());

        let mut memory = TaggedMemory::open(config.clone()).unwrap();
        memory.store("plan", "ship it", Layer::Working, 60).unwrap();
        memory.disk_backup().unwrap();
        std::fs::write(&config.memory_file, "{ not json").unwrap();

        assert!(dispatch(&config, Commands::Get { name: "plan".into() })
            .await
            .is_err());
        assert!(dispatch(&config, Commands::Verify).await.is_err());
        dispatch(&config, Commands::Recover).await.unwrap();
        dispatch(&config, Commands::Verify).await.unwrap();

        let mut reopened = TaggedMemory::open(config).unwrap();
        assert_eq!(reopened.retrieve("plan").unwrap(), "ship it");
    }

    #[tokio::test]
    async fn budget_applies_configured_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            max_working_size: 10,
            ..MemoryConfig::in_dir(dir.path())
        };

        let mut memory = TaggedMemory::open(config.clone()).unwrap();
        memory.store("big", &"b".repeat(40), Layer::Working, 20).unwrap();
        memory.save().unwrap();

        dispatch(&config, Commands::Budget).await.unwrap();
        let reopened = TaggedMemory::open(config).unwrap();
        assert_eq!(reopened.key("big").unwrap().layer, Layer::Disk);
    }
}
