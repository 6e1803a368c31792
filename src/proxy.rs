use crate::error::{Error, Result};
use crate::record::{self, RequestRecord, ResponseRecord};
use crate::store::{RequestStore, ResponseStore};
use crate::wire::{self, WireRequest};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub mod ca;

use ca::CertificateAuthority;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Exact reply clients expect before the TLS handshake starts.
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\n\n";

pub(crate) struct ProxyHandler<CA, Q, S> {
    ca: Arc<CA>,
    requests: Arc<Q>,
    responses: Arc<S>,
    outbound_tls: TlsConnector,
    max_body: usize,
}

impl<CA, Q, S> Clone for ProxyHandler<CA, Q, S> {
    fn clone(&self) -> Self {
        Self {
            ca: self.ca.clone(),
            requests: self.requests.clone(),
            responses: self.responses.clone(),
            outbound_tls: self.outbound_tls.clone(),
            max_body: self.max_body,
        }
    }
}

impl<CA, Q, S> ProxyHandler<CA, Q, S>
where
    CA: CertificateAuthority + Send + Sync + 'static,
    Q: RequestStore + Send + Sync + 'static,
    S: ResponseStore + Send + Sync + 'static,
{
    /// `root_cert_pem` extends the webpki roots used to verify intercepted
    /// origins, so hosts signed by the local root remain reachable.
    pub fn new(
        ca: Arc<CA>,
        requests: Arc<Q>,
        responses: Arc<S>,
        root_cert_pem: &[u8],
        max_body: usize,
    ) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in rustls_pemfile::certs(&mut &root_cert_pem[..]) {
            let cert = cert.map_err(Error::handshake)?;
            roots.add(cert).map_err(Error::handshake)?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            ca,
            requests,
            responses,
            outbound_tls: TlsConnector::from(Arc::new(config)),
            max_body,
        })
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let req = match timeout(STEP_TIMEOUT, wire::read_request(&mut stream, self.max_body))
            .await
            .map_err(|_| Error::timeout("read client request"))?
        {
            Ok(req) => req,
            Err(err) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await;
                return Err(err);
            }
        };

        if req.is_connect() {
            self.intercept(stream, req).await
        } else {
            self.forward(stream, req).await
        }
    }

    /// Plaintext path: dial the origin over TCP and relay one exchange.
    async fn forward(&self, client: TcpStream, mut req: WireRequest) -> Result<()> {
        let (host, port) = origin_target(&req, "http")?;
        let authority = format!("{host}:{port}");

        let origin = timeout(STEP_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::timeout("dial origin"))?
            .map_err(Error::dial)?;

        prepare_for_forward(&mut req, &authority);
        let record = RequestRecord::from_wire(&req, "http", Some(&authority))?;
        self.exchange(client, origin, req, record).await
    }

    /// TLS-intercept path: terminate TLS toward the client with a minted
    /// leaf, then open a fresh verified TLS session to the true origin.
    async fn intercept(&self, mut client: TcpStream, connect_req: WireRequest) -> Result<()> {
        let authority = connect_req.target.clone();
        let (host, port) = record::split_authority(&authority);
        let port = port.unwrap_or(443);

        client
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(Error::dial)?;

        let server_config = self.ca.server_config(&host).await?;
        let mut tls_client = timeout(
            STEP_TIMEOUT,
            TlsAcceptor::from(server_config).accept(client),
        )
        .await
        .map_err(|_| Error::timeout("client handshake"))?
        .map_err(Error::handshake)?;

        let mut inner = timeout(
            STEP_TIMEOUT,
            wire::read_request(&mut tls_client, self.max_body),
        )
        .await
        .map_err(|_| Error::timeout("read intercepted request"))??;

        let tcp = timeout(STEP_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::timeout("dial origin"))?
            .map_err(Error::dial)?;
        let server_name =
            ServerName::try_from(host.clone()).map_err(Error::dial)?;
        let origin = timeout(STEP_TIMEOUT, self.outbound_tls.connect(server_name, tcp))
            .await
            .map_err(|_| Error::timeout("origin handshake"))?
            .map_err(Error::handshake)?;

        prepare_for_forward(&mut inner, &authority);
        let record = RequestRecord::from_wire(&inner, "https", Some(&authority))?;
        self.exchange(tls_client, origin, inner, record).await
    }

    /// Shared tail of both paths: capture the request, relay it, capture the
    /// response best-effort, forward the verbatim bytes to the client.
    async fn exchange<C, O>(
        &self,
        mut client: C,
        mut origin: O,
        req: WireRequest,
        record: RequestRecord,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        O: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let head_request = req.method.eq_ignore_ascii_case("HEAD");
        let request_id = self.requests.save(&record).await?;

        timeout(
            STEP_TIMEOUT,
            origin.write_all(&wire::serialize_request(&req)),
        )
        .await
        .map_err(|_| Error::timeout("write request to origin"))?
        .map_err(Error::dial)?;

        let resp = timeout(
            STEP_TIMEOUT,
            wire::read_response(&mut origin, self.max_body, head_request),
        )
        .await
        .map_err(|_| Error::timeout("read origin response"))??;

        let response_record = ResponseRecord::from_wire(&request_id, &resp);
        if let Err(err) = self.responses.save(&request_id, &response_record).await {
            tracing::warn!("store: response capture for request {request_id} failed: {err}");
        }

        timeout(STEP_TIMEOUT, client.write_all(&resp.raw))
            .await
            .map_err(|_| Error::timeout("write response to client"))?
            .map_err(Error::dial)?;
        Ok(())
    }
}

/// Origin `host:port` for a plaintext request, from the absolute-form target
/// or the `Host` header.
fn origin_target(req: &WireRequest, scheme: &str) -> Result<(String, u16)> {
    let (target_authority, _, _) = record::split_target(&req.target);
    let authority = target_authority
        .map(str::to_string)
        .or_else(|| req.header("host").map(str::to_string))
        .ok_or_else(|| Error::Decode("request has no authority".to_string()))?;
    let (host, port) = record::split_authority(&authority);
    let default = if scheme == "https" { 443 } else { 80 };
    Ok((host, port.unwrap_or(default)))
}

/// Hop-by-hop hygiene before the request goes to the origin: strip
/// `Proxy-Connection` and `Accept-Encoding`, rewrite the target to
/// origin-form, make sure `Host` survives.
fn prepare_for_forward(req: &mut WireRequest, authority: &str) {
    req.remove_header("Proxy-Connection");
    req.remove_header("Accept-Encoding");

    if let Some(stripped) = req
        .target
        .strip_prefix("http://")
        .or_else(|| req.target.strip_prefix("https://"))
    {
        req.target = match stripped.find('/') {
            Some(slash) => stripped[slash..].to_string(),
            None => "/".to_string(),
        };
    }

    if req.header("host").is_none() {
        req.headers
            .insert(0, ("Host".to_string(), authority.to_string()));
    }
}

pub(crate) async fn start_proxy<CA, Q, S>(
    port: u16,
    handler: ProxyHandler<CA, Q, S>,
) -> anyhow::Result<()>
where
    CA: CertificateAuthority + Send + Sync + 'static,
    Q: RequestStore + Send + Sync + 'static,
    S: ResponseStore + Send + Sync + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("proxy: listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let handler = handler.clone();
        tokio::task::spawn(async move {
            if let Err(err) = handler.handle(stream).await {
                tracing::error!("proxy: connection failed: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str, headers: &[(&str, &str)]) -> WireRequest {
        WireRequest {
            method: "GET".to_string(),
            target: target.to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn origin_comes_from_absolute_target() {
        let req = request("http://origin:8080/a", &[("Host", "origin:8080")]);
        assert_eq!(
            origin_target(&req, "http").unwrap(),
            ("origin".to_string(), 8080)
        );
    }

    #[test]
    fn origin_falls_back_to_host_header_with_default_port() {
        let req = request("/a", &[("Host", "origin")]);
        assert_eq!(
            origin_target(&req, "http").unwrap(),
            ("origin".to_string(), 80)
        );
    }

    #[test]
    fn hygiene_strips_hop_headers_and_absolute_form() {
        let mut req = request(
            "http://origin/a?x=1",
            &[
                ("Host", "origin"),
                ("Proxy-Connection", "keep-alive"),
                ("Accept-Encoding", "gzip"),
                ("User-Agent", "curl"),
            ],
        );
        prepare_for_forward(&mut req, "origin:80");
        assert_eq!(req.target, "/a?x=1");
        assert!(req.header("proxy-connection").is_none());
        assert!(req.header("accept-encoding").is_none());
        assert_eq!(req.header("user-agent"), Some("curl"));
        assert_eq!(req.header("host"), Some("origin"));
    }

    #[test]
    fn hygiene_synthesizes_missing_host() {
        let mut req = request("/a", &[]);
        prepare_for_forward(&mut req, "origin:8080");
        assert_eq!(req.header("host"), Some("origin:8080"));
    }
}
