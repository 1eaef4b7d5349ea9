use std::sync::Arc;

use anyhow::Result;
use pagelock::{
    buffer::{BufferPool, MemoryPageStore},
    config::Config,
    console::Console,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config = match Config::load(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            println!("{}", e);
            println!("Usage: cargo run -- [--capacity N] [--log FILTER]");
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_writer(std::io::stderr)
        .init();

    let pool = Arc::new(BufferPool::with_config(
        &config,
        Arc::new(MemoryPageStore::new()),
    ));
    Console::new(pool).start()
}
