#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use relayd::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relayd", about = "Zero-downtime HTTP(S) reverse proxy")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overrides the config file's server.listen
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/metrics/status), overrides
    /// server.admin_listen
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
