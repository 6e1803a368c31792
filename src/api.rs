use crate::error::{Error, Result};
use crate::replay::{self, Replayer};
use crate::scan;
use crate::store::{RequestStore, ResponseStore};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

const DEFAULT_LIST_SIZE: i64 = 5;

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Decode(_) => StatusCode::BAD_REQUEST,
        Error::Dial(_) | Error::Handshake(_) | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::Store(_) | Error::Mint(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn error_response(message: &str, err: &Error) -> Response<Full<Bytes>> {
    tracing::error!("api: {message}: {err}");
    Response::builder()
        .status(status_for(err))
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(format!("{message}: {err}\n"))))
        .unwrap()
}

fn json_response<T: serde::Serialize>(data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(data) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap(),
        Err(err) => error_response("Failed to encode response", &Error::store(err)),
    }
}

fn text_response(bytes: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap()
}

/// `?limit=N` with a default of 5; malformed or negative values fall back.
fn limit_param(query: Option<&str>) -> i64 {
    let Some(query) = query else {
        return DEFAULT_LIST_SIZE;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "limit" {
            return value
                .parse()
                .ok()
                .filter(|n: &i64| *n >= 0)
                .unwrap_or(DEFAULT_LIST_SIZE);
        }
    }
    DEFAULT_LIST_SIZE
}

async fn repeat_request<Q>(
    requests: &Q,
    replayer: &Replayer,
    id: &str,
) -> Result<Response<Full<Bytes>>>
where
    Q: RequestStore + Send + Sync,
{
    let record = requests.get(id).await?;
    let resp = replayer.repeat(&record).await?;

    let status = StatusCode::from_u16(resp.code)
        .map_err(|e| Error::Upstream(format!("invalid status {}: {e}", resp.code)))?;
    let mut builder = Response::builder().status(status);
    for (name, value) in &resp.headers {
        // hyper frames the forwarded body itself.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Full::new(Bytes::from(resp.body)))
        .map_err(|e| Error::Upstream(e.to_string()))
}

async fn scan_request<Q>(requests: &Q, replayer: &Replayer, id: &str) -> Result<Vec<u8>>
where
    Q: RequestStore + Send + Sync,
{
    let record = requests.get(id).await?;
    let outcome = scan::scan(&record, replayer).await?;
    Ok(outcome.render())
}

async fn handle_request<Q, S>(
    req: Request<hyper::body::Incoming>,
    requests: Arc<Q>,
    responses: Arc<S>,
    replayer: Arc<Replayer>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error>
where
    Q: RequestStore + Send + Sync + 'static,
    S: ResponseStore + Send + Sync + 'static,
{
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let limit = limit_param(req.uri().query());

    let response = match (req.method(), segments.as_slice()) {
        (&Method::GET, ["requests"]) => match requests.list(limit).await {
            Ok(records) => json_response(&records),
            Err(err) => error_response("Failed to list requests", &err),
        },
        (&Method::GET, ["requests", id]) => match requests.get(id).await {
            Ok(record) => json_response(&record),
            Err(err) => error_response("Failed to get request", &err),
        },
        (&Method::GET, ["requests", id, "dump"]) => match requests.get(id).await {
            Ok(record) => text_response(replay::dump(&record)),
            Err(err) => error_response("Failed to dump request", &err),
        },
        (&Method::GET, ["requests", id, "response"]) => match responses.get_by_request(id).await {
            Ok(record) => json_response(&record),
            Err(err) => error_response("Failed to get response", &err),
        },
        (&Method::GET, ["repeat", id]) => {
            match repeat_request(requests.as_ref(), &replayer, id).await {
                Ok(resp) => resp,
                Err(err) => error_response("Failed to repeat request", &err),
            }
        }
        (&Method::GET, ["scan", id]) => match scan_request(requests.as_ref(), &replayer, id).await {
            Ok(report) => text_response(report),
            Err(err) => error_response("Failed to scan request", &err),
        },
        (&Method::GET, ["responses"]) => match responses.list(limit).await {
            Ok(records) => json_response(&records),
            Err(err) => error_response("Failed to list responses", &err),
        },
        (&Method::GET, ["responses", id]) => match responses.get(id).await {
            Ok(record) => json_response(&record),
            Err(err) => error_response("Failed to get response", &err),
        },
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap(),
    };

    Ok(response)
}

pub(crate) async fn start_api_server<Q, S>(
    port: u16,
    requests: Arc<Q>,
    responses: Arc<S>,
    replayer: Arc<Replayer>,
) -> anyhow::Result<()>
where
    Q: RequestStore + Send + Sync + 'static,
    S: ResponseStore + Send + Sync + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("api: listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let requests = Arc::clone(&requests);
        let responses = Arc::clone(&responses);
        let replayer = Arc::clone(&replayer);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                handle_request(
                    req,
                    Arc::clone(&requests),
                    Arc::clone(&responses),
                    Arc::clone(&replayer),
                )
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("api: error serving connection: {:?}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_fallbacks() {
        assert_eq!(limit_param(None), 5);
        assert_eq!(limit_param(Some("limit=12")), 12);
        assert_eq!(limit_param(Some("limit=zero")), 5);
        assert_eq!(limit_param(Some("limit=-3")), 5);
        assert_eq!(limit_param(Some("other=1")), 5);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(
            status_for(&Error::not_found("9")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::Decode("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Dial("refused".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::Handshake("alert".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::Upstream("garbage".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::Store("io".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Error::Mint("empty".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Error::timeout("dial")),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn error_body_is_message_colon_error() {
        let resp = error_response("Failed to get request", &Error::not_found("42"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
