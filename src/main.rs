use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install ring crypto provider");

    tracing_subscriber::fmt::init();

    let config = wiretap::config::Config::default();
    tracing::info!("Starting wiretap with config: {:?}", config);

    wiretap::run(config).await
}
