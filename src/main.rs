#[tokio::main]
async fn main() -> anyhow::Result<()> {
    the_small_orders::run().await
}
