//! Larder CLI
//!
//! Entry point for the `larder` command-line tool: the operator surface
//! over the cache core. Activation, flush, garbage collection, and lock
//! recovery all run through here; the host application talks to the
//! library directly.

use clap::{Parser, Subcommand};
use larder::{
    normalize_size, CacheStore, DropInManager, GarbageCollector, GcError, LockCoordinator,
    LockError, Settings, SettingsError, StatsReporter,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "File-backed object cache maintenance", version)]
struct Cli {
    /// Path to settings file (default: ./larder.toml when present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the cache activation state and size
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Install the drop-in descriptor, unless a foreign one is present
    Enable,

    /// Remove the drop-in descriptor
    Disable,

    /// Overwrite the drop-in descriptor unconditionally
    Update,

    /// Remove every cache entry
    Flush,

    /// Run one garbage collection pass
    Gc {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove a leftover maintenance lock
    Clearlock,

    /// Print the backend identifier and version
    Type,
}

fn main() {
    let cli = Cli::parse();

    // Log to stderr so command output stays parseable
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = match load_settings(cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Status { json } => run_status(&settings, json),
        Commands::Enable => run_enable(&settings),
        Commands::Disable => run_disable(&settings),
        Commands::Update => run_update(&settings),
        Commands::Flush => run_flush(&settings),
        Commands::Gc { json } => run_gc(&settings, json),
        Commands::Clearlock => run_clearlock(&settings),
        Commands::Type => run_type(),
    }
}

fn run_status(settings: &Settings, json: bool) {
    // No directory creation here; status must work on an untouched box
    let store = CacheStore::new(&settings.cache_dir);
    let reporter = StatsReporter::new(store, dropin_for(settings))
        .with_size_reporting(settings.size_reporting);

    let status = reporter.status();
    let size = reporter.cache_size(true).ok().flatten();

    if json {
        let payload = serde_json::json!({
            "enabled": status.enabled,
            "dropin_present": status.dropin_present,
            "descriptor_path": status.descriptor_path,
            "cache_dir": status.cache_dir,
            "cache_size": size,
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
    } else {
        let status_text = if status.enabled {
            "Enabled"
        } else if status.dropin_present {
            "Unknown drop-in"
        } else {
            "Disabled"
        };
        println!("{}{}", title("Cache Status"), status_text);
        println!("{}{}", title("Cache Path"), status.cache_dir.display());
        if let Some(size) = size {
            println!("{}{}", title("Cache Size"), normalize_size(size));
        }
    }

    process::exit(if status.enabled { 0 } else { 1 });
}

fn run_enable(settings: &Settings) {
    let dropin = dropin_for(settings);

    if dropin.validate() {
        println!("Object cache already enabled.");
        process::exit(0);
    }
    if let Err(e) = dropin.ensure_ours() {
        eprintln!("Error: {}. To overwrite it, run: larder update", e);
        process::exit(1);
    }

    // Make sure the store is usable before advertising it to the host
    open_store(settings);

    match dropin.install() {
        Ok(()) => {
            println!("Object cache enabled.");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: object cache could not be enabled: {}", e);
            process::exit(1);
        }
    }
}

fn run_disable(settings: &Settings) {
    let dropin = dropin_for(settings);

    if !dropin.exists() {
        eprintln!("Error: no object cache drop-in found.");
        process::exit(1);
    }
    if let Err(e) = dropin.ensure_ours() {
        eprintln!("Error: {}. Leaving it in place.", e);
        process::exit(1);
    }

    match dropin.uninstall() {
        Ok(_) => {
            println!("Object cache disabled.");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: object cache could not be disabled: {}", e);
            process::exit(1);
        }
    }
}

fn run_update(settings: &Settings) {
    open_store(settings);

    match dropin_for(settings).install() {
        Ok(()) => {
            println!("Object cache drop-in updated.");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: object cache drop-in could not be updated: {}", e);
            process::exit(1);
        }
    }
}

fn run_flush(settings: &Settings) {
    let store = open_store(settings);
    let lock = lock_for(settings);

    let guard = match lock.try_acquire() {
        Ok(guard) => guard,
        Err(LockError::Busy) => {
            eprintln!("Error: cache maintenance already in progress. Try again, or run: larder clearlock");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: object cache could not be flushed: {}", e);
            process::exit(1);
        }
    };

    let outcome = store.flush();
    drop(guard);

    match outcome {
        Ok(removed) => {
            println!("The cache was flushed. {} entries removed.", removed);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: object cache could not be flushed: {}", e);
            process::exit(1);
        }
    }
}

fn run_gc(settings: &Settings, json: bool) {
    let store = open_store(settings);
    let gc = GarbageCollector::new(store, lock_for(settings), settings.gc.clone());

    if !json {
        println!("Executing the garbage collector. Please wait..");
    }

    let result = match gc.run() {
        Ok(result) => result,
        Err(e @ GcError::Busy) => {
            eprintln!("Error: {}. Try again, or run: larder clearlock", e);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if json {
        match result.to_json() {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
        process::exit(0);
    }

    let pad = 35;
    println!("{}{}", title_pad("Cache MaxTTL", pad), result.cache_maxttl);
    println!("{}{}", title_pad("Cache File Limit", pad), result.cache_maxfile);
    println!(
        "{}{}",
        title_pad("Cache Disk Limit", pad),
        normalize_size(result.cache_maxdisk)
    );
    println!("{}{}", title_pad("Cleanup Cache MaxTTL", pad), result.cleanup_maxttl);
    println!(
        "{}{}",
        title_pad("Cleanup Cache File Limit", pad),
        result.cleanup_maxfile
    );
    println!(
        "{}{}",
        title_pad("Cleanup Cache Precache Limit", pad),
        result.cleanup_precache_maxfile
    );
    println!(
        "{}{}",
        title_pad("Cleanup Cache Disk Limit", pad),
        normalize_size(result.cleanup_maxdisk)
    );
    println!("{}{}", title_pad("Total Cache Cleanup", pad), result.cache_cleanup);
    println!("{}{}", title_pad("Total Cache Ignored", pad), result.cache_ignore);
    println!("{}{}", title_pad("Total Cache File", pad), result.cache_file);

    println!("Garbage collection completed.");
    process::exit(0);
}

fn run_clearlock(settings: &Settings) {
    match lock_for(settings).clear() {
        Ok(true) => {
            println!("The lock file was removed.");
            process::exit(0);
        }
        Ok(false) => {
            println!("No lock file found.");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: the lock file could not be removed: {}", e);
            process::exit(1);
        }
    }
}

fn run_type() {
    println!("larder (v{})", env!("CARGO_PKG_VERSION"));
    process::exit(0);
}

fn load_settings(config_path: Option<PathBuf>) -> Result<Settings, SettingsError> {
    match config_path {
        Some(path) => Settings::from_file(&path),
        None => {
            let path = PathBuf::from(Settings::DEFAULT_FILENAME);
            if path.exists() {
                Settings::from_file(&path)
            } else {
                Ok(Settings::default())
            }
        }
    }
}

fn open_store(settings: &Settings) -> CacheStore {
    match CacheStore::open(&settings.cache_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!(
                "Error: cache directory {} is not usable: {}",
                settings.cache_dir.display(),
                e
            );
            process::exit(1);
        }
    }
}

fn lock_for(settings: &Settings) -> LockCoordinator {
    LockCoordinator::new(&settings.cache_dir)
        .with_staleness(Duration::from_secs(settings.lock_stale_secs))
}

fn dropin_for(settings: &Settings) -> DropInManager {
    DropInManager::new(&settings.dropin_path, &settings.cache_dir)
}

fn title(text: &str) -> String {
    title_pad(text, 15)
}

fn title_pad(text: &str, pad: usize) -> String {
    format!("{text:<pad$}: ")
}
