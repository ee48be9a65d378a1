use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    switchyard_cli::cli::cli().await
}
