// ABOUTME: Entry point for the hive-worker binary.
// ABOUTME: Runs one worker process over stdin/stdout until the host closes the channel.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive_runtime_lib::run().await?;
    Ok(())
}
