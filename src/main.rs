use beaverkv::{Error, KV};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "beaverkv",
    version = VERSION,
    about = "Single-file key-value store."
)]
struct Cli {
    /// Path of the store file. Created on first use.
    #[arg(long, env = "BEAVERKV_PATH", default_value = "kvstore.data")]
    path: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value stored under a key.
    Get { key: String },
    /// Insert or replace a key.
    Set { key: String, value: String },
    /// Delete a key.
    Del { key: String },
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut kv = KV::open(&cli.path)?;
    match cli.command {
        Command::Get { key } => match kv.get(key.as_bytes())? {
            Some(val) => println!("{}", String::from_utf8_lossy(&val)),
            None => println!("(not found)"),
        },
        Command::Set { key, value } => {
            kv.set(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Command::Del { key } => {
            kv.del(key.as_bytes())?;
            println!("OK");
        }
    }
    kv.close();
    Ok(())
}

fn main() {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open("beaverkv.log")
        .expect("Failed to open log file");

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        println!("Error: {}", e);
        std::process::exit(1);
    }
}
