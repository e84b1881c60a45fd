use anyhow::Result;
use telemetry_bridge::{cli, instrumentation};

#[tokio::main]
async fn main() -> Result<()> {
    instrumentation::tracing::init_panic_handler();

    // The CLI parses the subcommand and calls into the runtime; `run`
    // installs the tracing subscriber once its config is loaded.
    cli::cli::run().await
}
