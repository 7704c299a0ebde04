use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    arabica_cli::main_entry().await
}
