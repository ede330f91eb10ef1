//! `ferry` reverse proxy binary.

mod cli;
mod telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    cli::run().await
}
