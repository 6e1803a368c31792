use crate::error::{Error, Result};
use crate::record::RequestRecord;
use crate::wire::{self, WireRequest, WireResponse};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;

const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Re-executes stored requests against their origin. The TLS trust store is
/// pinned to the configured root certificate, redirects are never followed,
/// and nothing a replay does is persisted.
pub struct Replayer {
    tls: TlsConnector,
    max_body: usize,
}

impl Replayer {
    pub fn new(root_cert_pem: &[u8], max_body: usize) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &root_cert_pem[..]) {
            let cert = cert.map_err(Error::handshake)?;
            roots.add(cert).map_err(Error::handshake)?;
        }
        if roots.is_empty() {
            return Err(Error::Handshake(
                "no usable certificate in the replay root file".to_string(),
            ));
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            max_body,
        })
    }

    /// Reconstructs and re-executes the capture, returning the origin's
    /// response as-is (a redirect comes back as the redirect).
    pub async fn repeat(&self, record: &RequestRecord) -> Result<WireResponse> {
        self.send(record, record.to_wire()).await
    }

    /// Executes an arbitrary request against the record's origin. Used by
    /// the scanner to submit mutated bodies.
    pub async fn send(&self, record: &RequestRecord, req: WireRequest) -> Result<WireResponse> {
        timeout(REPLAY_TIMEOUT, self.exchange(record, req))
            .await
            .map_err(|_| Error::timeout("replay exchange"))?
    }

    async fn exchange(&self, record: &RequestRecord, req: WireRequest) -> Result<WireResponse> {
        let (host, port) = record.origin();
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(Error::dial)?;

        if record.scheme == "https" {
            let server_name = ServerName::try_from(host.clone()).map_err(Error::dial)?;
            let stream = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(Error::handshake)?;
            self.roundtrip(stream, &req).await
        } else {
            self.roundtrip(tcp, &req).await
        }
    }

    async fn roundtrip<S>(&self, mut stream: S, req: &WireRequest) -> Result<WireResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&wire::serialize_request(req))
            .await
            .map_err(Error::dial)?;
        let head_request = req.method.eq_ignore_ascii_case("HEAD");
        wire::read_response(&mut stream, self.max_body, head_request).await
    }
}

/// The wire-format dump of a reconstructed request.
pub fn dump(record: &RequestRecord) -> Vec<u8> {
    wire::serialize_request(&record.to_wire())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_request;
    use tokio::net::TcpListener;

    fn record_for(host: &str) -> RequestRecord {
        let wire = WireRequest {
            method: "GET".to_string(),
            target: "/moved".to_string(),
            headers: vec![("Host".to_string(), host.to_string())],
            body: Vec::new(),
        };
        RequestRecord::from_wire(&wire, "http", None).unwrap()
    }

    #[test]
    fn dump_is_wire_format() {
        let record = record_for("example.tld");
        let text = String::from_utf8(dump(&record)).unwrap();
        assert!(text.starts_with("GET /moved HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.tld\r\n"));
    }

    #[tokio::test]
    async fn repeat_returns_redirects_without_following() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream, 1024).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
        });

        // Roots never come into play on the plaintext path; the constructor
        // just needs one parseable certificate.
        let (_, root_pem) = crate::proxy::ca::generate_test_root();
        let replayer = Replayer::new(&root_pem, 1024 * 1024).unwrap();
        let record = record_for(&addr.to_string());
        let resp = replayer.repeat(&record).await.unwrap();
        assert_eq!(resp.code, 302);
        assert_eq!(
            resp.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("location"))
                .map(|(_, v)| v.as_str()),
            Some("/elsewhere")
        );
    }
}
