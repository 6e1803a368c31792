use anyhow::Context;
use std::sync::Arc;

pub(crate) mod api;
pub mod config;
pub mod error;
pub mod record;
pub mod proxy;
pub(crate) mod replay;
pub(crate) mod scan;
pub mod store;
pub mod wire;

pub use error::{Error, Result};

pub async fn run(config: config::Config) -> anyhow::Result<()> {
    let store = Arc::new(store::LibSqlStore::connect(&config.db_url).await?);
    store.init_tables().await?;
    run_with_store(config, store.clone(), store).await
}

pub async fn run_with_store<Q, S>(
    config: config::Config,
    requests: Arc<Q>,
    responses: Arc<S>,
) -> anyhow::Result<()>
where
    Q: store::RequestStore + Send + Sync + 'static,
    S: store::ResponseStore + Send + Sync + 'static,
{
    let signing_key = config
        .signing_key_bytes()
        .context("failed to read the signing key")?;
    let root_cert = config
        .root_cert_bytes()
        .context("failed to read the root certificate")?;

    let authority = Arc::new(
        proxy::ca::OpenSslAuthority::new(&signing_key, &root_cert, &config.certs_dir).await?,
    );
    let replayer = Arc::new(replay::Replayer::new(&root_cert, config.max_body_bytes)?);
    let handler = proxy::ProxyHandler::new(
        authority,
        requests.clone(),
        responses.clone(),
        &root_cert,
        config.max_body_bytes,
    )?;

    let proxy_result = proxy::start_proxy(config.proxy_port, handler);
    let api_result = api::start_api_server(config.api_port, requests, responses, replayer);

    tokio::select! {
        result = proxy_result => result,
        result = api_result => result,
    }
}
