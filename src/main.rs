//! `nix-store` — thin CLI glue over the `qnix_store` library.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use qnix_store::{Config, ObjectId, Store};

const DEFAULT_CONFIG_PATH: &str = "/data/nix/nix.conf";

#[derive(Parser)]
#[command(name = "nix-store", about = "Content-addressed package store")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Raise the tracing verbosity (stacks: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the store root and registry.
    Init,
    /// Import a file or directory into the store.
    Add { path: PathBuf, name: Option<String> },
    /// Import a file into the store, auto-scanning its dynamic library dependencies.
    AddWithDeps { path: PathBuf, name: Option<String> },
    /// Bulk-import every shared library under the configured boot-ramdisk library directory.
    AddBootLibs,
    /// Install a store object into a profile.
    Install { object: String, profile: Option<String> },
    /// Recompute and compare an object's content hash against what's recorded.
    Verify { object: String },
    /// Run one mark-and-sweep garbage collection pass.
    Gc,
    /// List an object's recorded references.
    QueryReferences { object: String },
    /// Add a GC root.
    AddRoot { object: String },
    /// Remove a GC root.
    RemoveRoot { object: String },
    /// Create a new profile.
    CreateProfile { name: String },
    /// Atomically switch the `current` profile symlink.
    SwitchProfile { name: String },
    /// List profiles.
    ListProfiles,
    /// Roll a profile back to its previous generation.
    Rollback { profile: String },
    /// List a profile's generations, newest first.
    ListGenerations { profile: String },
    /// Switch a profile to an explicit generation epoch.
    SwitchGeneration { profile: String, epoch: u64 },
    /// Enter an isolated shell for a profile.
    Shell { profile: String },
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_object(s: &str) -> anyhow::Result<ObjectId> {
    s.parse().context("not a valid object identifier")
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config).context("loading configuration")?;
    let store_root = config.store.store_path.clone();

    match cli.command {
        Command::Init => {
            Store::init(&store_root, config)?;
            Config::write_default(&cli.config)?;
            println!("initialized store at {}", store_root.display());
        }
        Command::Add { path, name } => {
            let mut store = Store::open(&store_root, config)?;
            let name = name.unwrap_or_else(|| default_name(&path));
            let id = store.add(&path, &name)?;
            println!("{id}");
        }
        Command::AddWithDeps { path, name } => {
            let mut store = Store::open(&store_root, config)?;
            let name = name.unwrap_or_else(|| default_name(&path));
            let id = store.add_with_deps(&path, &name)?;
            println!("{id}");
        }
        Command::AddBootLibs => {
            let mut store = Store::open(&store_root, config)?;
            let imported = store.add_boot_libs()?;
            for id in imported {
                println!("{id}");
            }
        }
        Command::Install { object, profile } => {
            let mut store = Store::open(&store_root, config.clone())?;
            let id = parse_object(&object)?;
            let profile = profile.unwrap_or(config.profiles.default_profile);
            store.install(&id, &profile)?;
            println!("installed {object} into profile '{profile}'");
        }
        Command::Verify { object } => {
            let store = Store::open(&store_root, config)?;
            let id = parse_object(&object)?;
            if store.verify(&id)? {
                println!("OK: {object}");
            } else {
                println!("MISMATCH: {object}");
                return Err(anyhow::anyhow!("content hash verification failed"));
            }
        }
        Command::Gc => {
            let mut store = Store::open(&store_root, config)?;
            let report = store.collect_garbage()?;
            println!(
                "kept {} objects, swept {}, {} sweep failures",
                report.marked.len(),
                report.swept.len(),
                report.sweep_failures.len()
            );
        }
        Command::QueryReferences { object } => {
            let store = Store::open(&store_root, config)?;
            let id = parse_object(&object)?;
            for path in store.query_references(&id) {
                println!("{}", path.display());
            }
        }
        Command::AddRoot { object } => {
            let mut store = Store::open(&store_root, config)?;
            let id = parse_object(&object)?;
            store.add_root(&id)?;
        }
        Command::RemoveRoot { object } => {
            let mut store = Store::open(&store_root, config)?;
            let id = parse_object(&object)?;
            store.remove_root(&id)?;
        }
        Command::CreateProfile { name } => {
            let mut store = Store::open(&store_root, config)?;
            let object_path = store.create_profile(&name)?;
            println!("created profile '{name}' -> {}", object_path.display());
        }
        Command::SwitchProfile { name } => {
            let store = Store::open(&store_root, config)?;
            store.switch_profile(&name)?;
        }
        Command::ListProfiles => {
            let store = Store::open(&store_root, config)?;
            for name in store.list_profiles()? {
                println!("{name}");
            }
        }
        Command::Rollback { profile } => {
            let store = Store::open(&store_root, config)?;
            store.rollback(&profile)?;
        }
        Command::ListGenerations { profile } => {
            let store = Store::open(&store_root, config)?;
            for epoch in store.list_generations(&profile)? {
                println!("{epoch}");
            }
        }
        Command::SwitchGeneration { profile, epoch } => {
            let store = Store::open(&store_root, config)?;
            store.switch_generation(&profile, epoch)?;
        }
        Command::Shell { profile } => {
            let store = Store::open(&store_root, config)?;
            let status = store.enter_shell(&profile)?;
            if !status.success() {
                return Err(anyhow::anyhow!("shell exited with {status}"));
            }
        }
    }

    Ok(())
}

fn default_name(path: &std::path::Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}
