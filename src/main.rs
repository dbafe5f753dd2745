#[tokio::main]
async fn main() -> Result<(), strategy_sync_lib::AppError> {
    strategy_sync_lib::run().await
}
