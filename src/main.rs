use mcm_bridge::options::Options;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::new();
    mcm_bridge::run(options).await
}
