#[tokio::main]
async fn main() -> std::io::Result<()> {
    bucketlens_lib::run().await
}
