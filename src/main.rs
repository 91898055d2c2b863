#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use aegis_gateway::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "aegis-gateway",
    about = "Distributed sliding-window rate limiting node"
)]
struct Cli {
    /// Path to node config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Public API listen address
    #[arg(short, long, default_value = "0.0.0.0:7260")]
    listen: String,

    /// Admin API listen address (for health/metrics/cluster)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_thread_count();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            std::process::exit(3);
        }
    };

    let result = rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }));

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
