#![forbid(unsafe_code)]

//! Binds the aggregating proxy to process stdio. Grounded on `xtask`'s
//! `clap::Parser` CLI shape (`crates/xtask/src/main.rs`) and its
//! `match ... { Ok(()) => 0, Err(err) => { eprintln!("{err}"); N } }` exit-code
//! pattern, generalized from "one task, several codes" to the three exit
//! classes a long-running server needs: clean shutdown, bad config, and a
//! fatal runtime error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mcp_proxy::{config, frame::StdioMode, logging, FrameStream, Router};

#[derive(Debug, Parser)]
#[command(name = "mcp-proxy")]
#[command(about = "Aggregating proxy for the Model Context Protocol")]
struct Cli {
    /// Path to a JSON `ProxyConfig` file.
    #[arg(long)]
    config: PathBuf,
}

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;

fn main() {
    // Phase one: a bare subscriber so config-load failures are still logged
    // somewhere, before we know the configured level.
    logging::init("info", false);

    let cli = Cli::parse();

    let config = match config::load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    // Phase two: re-init with the level and format the config actually asked
    // for. `logging::init` is idempotent, so this simply layers the real
    // settings over the bootstrap subscriber.
    logging::init(&config.log_level, config.structured_logging);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: mcp_proxy::ProxyConfig) -> i32 {
    let stdio_mode: StdioMode = config.stdio_mode.into();
    let client_frame = Arc::new(FrameStream::new(tokio::io::stdin(), tokio::io::stdout(), stdio_mode));

    let router = Router::new(config, client_frame);
    match router.serve().await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            tracing::error!(error = %err, "proxy terminated with a fatal error");
            EXIT_RUNTIME_ERROR
        }
    }
}
