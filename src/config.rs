use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxy_port: u16,
    pub api_port: u16,
    pub db_url: String,
    pub signing_key_path: PathBuf,
    pub root_cert_path: PathBuf,
    pub certs_dir: PathBuf,
    pub max_body_bytes: usize,
}

impl Config {
    pub fn signing_key_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.signing_key_path)
    }

    pub fn root_cert_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.root_cert_path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: std::env::var("WIRETAP_PROXY_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            api_port: std::env::var("WIRETAP_API_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .unwrap_or(8000),
            db_url: std::env::var("WIRETAP_DB_URL").unwrap_or_else(|_| "http_proxy.db".to_string()),
            signing_key_path: std::env::var("WIRETAP_SIGNING_KEY_PATH")
                .unwrap_or_else(|_| "https/cert.key".to_string())
                .into(),
            root_cert_path: std::env::var("WIRETAP_ROOT_CERT_PATH")
                .unwrap_or_else(|_| "https/ca.crt".to_string())
                .into(),
            certs_dir: std::env::var("WIRETAP_CERTS_DIR")
                .unwrap_or_else(|_| "certs".to_string())
                .into(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}
