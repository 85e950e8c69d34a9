mod actix;
mod settings;

use std::io;
use std::sync::Arc;

use clap::Parser;
use virtual_file::VirtualFile;

use crate::settings::{Overrides, Settings};

/// Re-stream a remote HTTP resource through a bounded, prefetching block cache.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address of the remote resource
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Memory budget of the block cache, in MB
    #[arg(short, long, value_name = "MB")]
    cache: Option<usize>,

    /// Size of a single block, in MB
    #[arg(short, long, value_name = "MB")]
    block: Option<usize>,

    /// Number of concurrent range requests
    #[arg(short, long, value_name = "N")]
    threads: Option<usize>,

    /// Path to an additional config file, merged over the default ones
    #[arg(long, value_name = "PATH")]
    config_path: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            cache_mb: self.cache,
            block_mb: self.block,
            threads: self.threads,
        }
    }
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::new(args.config_path.clone()).map_err(io::Error::other)?;
    settings.apply(args.overrides());

    let log_level = settings.log_level.clone().unwrap_or_else(|| "INFO".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
    settings.validate_and_warn();

    // Download workers use blocking HTTP clients, they are created before the actix runtime starts
    let file = Arc::new(VirtualFile::new());
    file.open(settings.file.clone()).map_err(io::Error::other)?;
    log::info!(
        "Cache of {} blocks of {} bytes, {} download workers",
        settings.file.buffers_count(),
        settings.file.block_size,
        settings.file.max_workers,
    );

    let result = actix::init(file.clone(), settings);
    file.close();
    result
}
