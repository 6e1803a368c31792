use crate::error::{Error, Result};
use async_trait::async_trait;
use moka::future::Cache;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rand,
    x509::{
        extension::{ExtendedKeyUsage, KeyUsage, SubjectAlternativeName},
        X509Builder, X509NameBuilder, X509,
    },
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, SystemTime},
};

const TTL_SECS: i64 = 365 * 24 * 60 * 60;
const CACHE_TTL: u64 = TTL_SECS as u64 / 2;
const NOT_BEFORE_OFFSET: i64 = 60;

#[async_trait]
pub trait CertificateAuthority {
    async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>>;
}

/// Mints leaf certificates for intercepted hosts, signed by the local root
/// with the single shared key. Leaves are cached in memory, persisted to the
/// certs directory, and reloaded from there on startup.
pub struct OpenSslAuthority {
    signing_key: PKey<Private>,
    private_key_der: PrivateKeyDer<'static>,
    root_cert: X509,
    hash_algo: MessageDigest,
    certs_dir: PathBuf,
    leaf_cache: Cache<String, Arc<Vec<u8>>>,
    config_cache: Cache<String, Arc<ServerConfig>>,
    minted: AtomicU64,
}

impl OpenSslAuthority {
    pub async fn new(
        signing_key_pem: &[u8],
        root_cert_pem: &[u8],
        certs_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let signing_key = PKey::private_key_from_pem(signing_key_pem).map_err(Error::mint)?;
        let der_bytes = signing_key.private_key_to_pkcs8().map_err(Error::mint)?;
        let private_key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der_bytes));
        let root_cert = X509::from_pem(root_cert_pem).map_err(Error::mint)?;

        let authority = Self {
            signing_key,
            private_key_der,
            root_cert,
            hash_algo: MessageDigest::sha256(),
            certs_dir: certs_dir.as_ref().to_path_buf(),
            leaf_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(CACHE_TTL))
                .build(),
            config_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(CACHE_TTL))
                .build(),
            minted: AtomicU64::new(0),
        };
        authority.warm_from_disk().await?;
        Ok(authority)
    }

    /// Loads previously minted leaves from `certs/<host>.crt` so restarts
    /// skip re-minting.
    async fn warm_from_disk(&self) -> Result<()> {
        if !self.certs_dir.exists() {
            std::fs::create_dir_all(&self.certs_dir).map_err(Error::mint)?;
            return Ok(());
        }
        let entries = std::fs::read_dir(&self.certs_dir).map_err(Error::mint)?;
        for entry in entries {
            let entry = entry.map_err(Error::mint)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(host) = name.strip_suffix(".crt") else {
                continue;
            };
            let pem = std::fs::read(entry.path()).map_err(Error::mint)?;
            if !pem.is_empty() {
                self.leaf_cache
                    .insert(host.to_string(), Arc::new(pem))
                    .await;
            }
        }
        let count = self.leaf_cache.entry_count();
        tracing::info!("ca: warmed {} cached leaf certificates", count);
        Ok(())
    }

    /// PEM leaf certificate for `host`. Concurrent callers for the same host
    /// share a single mint.
    pub async fn leaf(&self, host: &str) -> Result<Arc<Vec<u8>>> {
        self.leaf_cache
            .try_get_with(host.to_string(), async {
                let pem = self.mint(host)?;
                if pem.is_empty() {
                    return Err(Error::Mint(format!("minted zero bytes for {host}")));
                }
                std::fs::write(self.certs_dir.join(format!("{host}.crt")), &pem)
                    .map_err(Error::mint)?;
                self.minted.fetch_add(1, Ordering::Relaxed);
                tracing::info!("ca: minted leaf certificate for {host}");
                Ok(Arc::new(pem))
            })
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }

    fn mint(&self, host: &str) -> Result<Vec<u8>> {
        let mut name_builder = X509NameBuilder::new().map_err(Error::mint)?;
        name_builder
            .append_entry_by_text("CN", host)
            .map_err(Error::mint)?;
        let name = name_builder.build();

        let mut builder = X509Builder::new().map_err(Error::mint)?;
        builder.set_subject_name(&name).map_err(Error::mint)?;
        builder.set_version(2).map_err(Error::mint)?;

        let not_before = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(Error::mint)?
            .as_secs() as i64
            - NOT_BEFORE_OFFSET;
        builder
            .set_not_before(Asn1Time::from_unix(not_before).map_err(Error::mint)?.as_ref())
            .map_err(Error::mint)?;
        builder
            .set_not_after(
                Asn1Time::from_unix(not_before + TTL_SECS)
                    .map_err(Error::mint)?
                    .as_ref(),
            )
            .map_err(Error::mint)?;

        builder.set_pubkey(&self.signing_key).map_err(Error::mint)?;
        builder
            .set_issuer_name(self.root_cert.subject_name())
            .map_err(Error::mint)?;

        let context = builder.x509v3_context(Some(&self.root_cert), None);
        let mut alternative_name = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            alternative_name.ip(host);
        } else {
            alternative_name.dns(host);
        }
        let alternative_name = alternative_name.build(&context).map_err(Error::mint)?;
        builder
            .append_extension(alternative_name)
            .map_err(Error::mint)?;
        builder
            .append_extension(
                KeyUsage::new()
                    .digital_signature()
                    .key_encipherment()
                    .build()
                    .map_err(Error::mint)?,
            )
            .map_err(Error::mint)?;
        builder
            .append_extension(
                ExtendedKeyUsage::new()
                    .server_auth()
                    .build()
                    .map_err(Error::mint)?,
            )
            .map_err(Error::mint)?;

        let mut serial_bytes = [0; 16];
        rand::rand_bytes(&mut serial_bytes).map_err(Error::mint)?;
        let serial = BigNum::from_slice(&serial_bytes).map_err(Error::mint)?;
        let serial = Asn1Integer::from_bn(&serial).map_err(Error::mint)?;
        builder.set_serial_number(&serial).map_err(Error::mint)?;

        builder
            .sign(&self.signing_key, self.hash_algo)
            .map_err(Error::mint)?;
        builder.build().to_pem().map_err(Error::mint)
    }
}

#[async_trait]
impl CertificateAuthority for OpenSslAuthority {
    async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        self.config_cache
            .try_get_with(host.to_string(), async {
                let pem = self.leaf(host).await?;
                let certs: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut pem.as_slice())
                        .collect::<std::result::Result<_, _>>()
                        .map_err(Error::handshake)?;
                if certs.is_empty() {
                    return Err(Error::Mint(format!("no certificate in leaf PEM for {host}")));
                }

                let mut config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, self.private_key_der.clone_key())
                    .map_err(Error::handshake)?;
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                Ok(Arc::new(config))
            })
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }
}

/// Generates a root key and self-signed CA certificate for tests, PEM
/// encoded as `(key, cert)`.
#[cfg(test)]
pub(crate) fn generate_test_root() -> (Vec<u8>, Vec<u8>) {
    use openssl::rsa::Rsa;
    use openssl::x509::extension::BasicConstraints;

    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "Test Root").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    builder
        .set_not_before(Asn1Time::from_unix(now - 60).unwrap().as_ref())
        .unwrap();
    builder
        .set_not_after(Asn1Time::from_unix(now + TTL_SECS).unwrap().as_ref())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(KeyUsage::new().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    let mut serial_bytes = [0; 16];
    rand::rand_bytes(&mut serial_bytes).unwrap();
    let serial = BigNum::from_slice(&serial_bytes).unwrap();
    builder
        .set_serial_number(Asn1Integer::from_bn(&serial).unwrap().as_ref())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    (
        key.private_key_to_pem_pkcs8().unwrap(),
        cert.to_pem().unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    async fn authority(dir: &Path) -> OpenSslAuthority {
        let (key_pem, cert_pem) = generate_test_root();
        OpenSslAuthority::new(&key_pem, &cert_pem, dir).await.unwrap()
    }

    #[tokio::test]
    async fn leaf_is_minted_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority(dir.path()).await;

        let pem = authority.leaf("example.tld").await.unwrap();
        assert!(!pem.is_empty());
        assert!(dir.path().join("example.tld.crt").exists());
        assert_eq!(authority.minted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn concurrent_leaf_calls_mint_once() {
        let dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(authority(dir.path()).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let authority = authority.clone();
            handles.push(tokio::spawn(
                async move { authority.leaf("dup.tld").await },
            ));
        }
        let mut leaves = Vec::new();
        for handle in handles {
            leaves.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(authority.minted.load(Ordering::Relaxed), 1);
        assert!(leaves.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn restart_warms_cache_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (key_pem, cert_pem) = generate_test_root();

        let first = OpenSslAuthority::new(&key_pem, &cert_pem, dir.path())
            .await
            .unwrap();
        let minted = first.leaf("warm.tld").await.unwrap();

        let second = OpenSslAuthority::new(&key_pem, &cert_pem, dir.path())
            .await
            .unwrap();
        let loaded = second.leaf("warm.tld").await.unwrap();
        assert_eq!(loaded, minted);
        assert_eq!(second.minted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn server_config_is_built_from_the_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority(dir.path()).await;
        let config = authority.server_config("example.tld").await.unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
