use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    bus_bridge::run().await
}
