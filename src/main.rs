use std::path::PathBuf;
use std::process;

use clap::Parser;

/// Locate OMF static-library object code inside a stripped 32-bit PE.
#[derive(Parser)]
#[command(name = "omfmatch", version)]
struct Cli {
    /// Target executable to search
    target: PathBuf,
    /// OMF libraries (or bare object files) providing candidate code
    #[arg(required = true)]
    libraries: Vec<PathBuf>,
}

fn main() {
    // Collisions, missing imports, and ambiguity reports must reach stderr
    // without RUST_LOG being set; info-level phase chatter stays opt-in.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Err(e) = omfmatch::driver::run(&cli.target, &cli.libraries) {
        eprintln!("omfmatch: error: {:#}", e);
        process::exit(1);
    }
}
