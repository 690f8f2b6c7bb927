mod worker;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("worker=debug,common=info,reqwest=info")
        .init();

    worker::run().await
}
