use crate::error::{Error, Result};
use crate::wire::WireRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A captured body: stored as text when the bytes decode as UTF-8, raw
/// bytes otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

impl Body {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Body::Text(text),
            Err(err) => Body::Binary(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Text(text) => text.as_bytes(),
            Body::Binary(bytes) => bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// A captured request, addressed by an opaque store id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub get_params: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, Vec<String>>,
    pub cookies: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_params: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub timestamp: i64,
}

/// A captured response, referencing the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub request_id: String,
    pub code: u16,
    pub message: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Body,
    pub timestamp: i64,
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// `Content-Type` → `Content-Type`, `x-tag` → `X-Tag`. Matches the header
/// casing the stored maps are keyed by.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Split an authority into host and explicit port. IPv6 literals keep their
/// brackets on the host side.
pub(crate) fn split_authority(authority: &str) -> (String, Option<u16>) {
    if let Some(end) = authority.rfind(':') {
        if !authority[end + 1..].is_empty() && authority[end + 1..].bytes().all(|b| b.is_ascii_digit())
        {
            if let Ok(port) = authority[end + 1..].parse() {
                return (authority[..end].to_string(), Some(port));
            }
        }
    }
    (authority.to_string(), None)
}

/// Split a request target into (authority-if-absolute-form, path, query).
/// The fragment, when a client sends one, stays attached to the path.
pub(crate) fn split_target(target: &str) -> (Option<&str>, String, String) {
    let (authority, rest) = if let Some(stripped) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        match stripped.find('/') {
            Some(slash) => (Some(&stripped[..slash]), &stripped[slash..]),
            None => (Some(stripped), "/"),
        }
    } else {
        (None, target)
    };

    match rest.split_once('?') {
        Some((path, after)) => match after.split_once('#') {
            Some((query, fragment)) => {
                (authority, format!("{path}#{fragment}"), query.to_string())
            }
            None => (authority, path.to_string(), after.to_string()),
        },
        None => (authority, rest.to_string(), String::new()),
    }
}

/// Query-string parse with `;` treated as `&` before decoding. Order within
/// a key is preserved.
fn parse_params(query: &str) -> HashMap<String, Vec<String>> {
    let normalized = query.replace(';', "&");
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(normalized.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// Form-encode params with sorted keys; value order within a key preserved.
fn encode_params(params: &HashMap<String, Vec<String>>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for key in keys {
        for value in &params[key] {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

pub(crate) fn group_headers(headers: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        grouped
            .entry(canonical_header_name(name))
            .or_default()
            .push(value.clone());
    }
    grouped
}

impl RequestRecord {
    /// Decompose a wire request into its capture form. `scheme` reflects
    /// whether interception occurred; `fallback_authority` is the CONNECT
    /// authority, used when the inner request carries no `Host`.
    pub fn from_wire(
        req: &WireRequest,
        scheme: &str,
        fallback_authority: Option<&str>,
    ) -> Result<Self> {
        let (target_authority, path, query) = split_target(&req.target);

        let authority = target_authority
            .map(str::to_string)
            .or_else(|| req.header("host").map(str::to_string))
            .or_else(|| fallback_authority.map(str::to_string))
            .ok_or_else(|| Error::Decode("request has no authority".to_string()))?;

        let (host, port) = split_authority(&authority);
        let host = match port {
            Some(port) if port != default_port(scheme) => format!("{host}:{port}"),
            _ => host,
        };

        let mut headers = group_headers(&req.headers);
        headers.remove("Cookie");

        let mut cookies = HashMap::new();
        for (name, value) in &req.headers {
            if name.eq_ignore_ascii_case("cookie") {
                for parsed in cookie::Cookie::split_parse(value.clone()).flatten() {
                    cookies.insert(parsed.name().to_string(), parsed.value().to_string());
                }
            }
        }

        let is_form = req
            .header("content-type")
            .map(|ct| ct.starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false);
        let (post_params, body) = if is_form {
            let form = String::from_utf8_lossy(&req.body);
            (Some(parse_params(&form)), None)
        } else if req.body.is_empty() {
            (None, None)
        } else {
            (None, Some(Body::from_bytes(req.body.clone())))
        };

        Ok(Self {
            id: None,
            method: req.method.to_uppercase(),
            scheme: scheme.to_string(),
            host,
            path,
            get_params: parse_params(&query),
            headers,
            cookies,
            post_params,
            body,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Rebuild a live request that round-trips this capture: origin-form
    /// target with the re-encoded query, stored headers, synthesized `Host`
    /// and `Cookie`, and the form or raw body.
    pub fn to_wire(&self) -> WireRequest {
        let query = encode_params(&self.get_params);
        let target = if query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, query)
        };

        let mut headers = vec![("Host".to_string(), self.host.clone())];

        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            for value in &self.headers[name] {
                headers.push((name.clone(), value.clone()));
            }
        }

        if !self.cookies.is_empty() {
            let mut cookie_names: Vec<&String> = self.cookies.keys().collect();
            cookie_names.sort();
            let header = cookie_names
                .iter()
                .map(|name| format!("{name}={}", self.cookies[name.as_str()]))
                .collect::<Vec<_>>()
                .join("; ");
            headers.push(("Cookie".to_string(), header));
        }

        let body = match &self.post_params {
            Some(params) => encode_params(params).into_bytes(),
            None => self
                .body
                .as_ref()
                .map(|b| b.as_bytes().to_vec())
                .unwrap_or_default(),
        };

        WireRequest {
            method: self.method.clone(),
            target,
            headers,
            body,
        }
    }

    /// Origin address this record points at, with the scheme default port
    /// when the authority carries none.
    pub fn origin(&self) -> (String, u16) {
        let (host, port) = split_authority(&self.host);
        (host, port.unwrap_or_else(|| default_port(&self.scheme)))
    }
}

impl ResponseRecord {
    pub fn from_wire(request_id: &str, resp: &crate::wire::WireResponse) -> Self {
        Self {
            id: None,
            request_id: request_id.to_string(),
            code: resp.code,
            message: resp.reason.clone(),
            headers: group_headers(&resp.headers),
            body: Body::from_bytes(resp.body.clone()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(method: &str, target: &str, headers: &[(&str, &str)], body: &[u8]) -> WireRequest {
        WireRequest {
            method: method.to_string(),
            target: target.to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn absolute_target_with_semicolon_query() {
        let req = wire("GET", "http://origin/a?x=1;y=2", &[("Host", "origin")], b"");
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.scheme, "http");
        assert_eq!(record.host, "origin");
        assert_eq!(record.path, "/a");
        assert_eq!(record.get_params["x"], vec!["1"]);
        assert_eq!(record.get_params["y"], vec!["2"]);
        assert!(record.body.is_none());
    }

    #[test]
    fn repeated_params_preserve_order() {
        let req = wire("GET", "/a?k=first&k=second", &[("Host", "h")], b"");
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.get_params["k"], vec!["first", "second"]);
    }

    #[test]
    fn default_port_is_stripped() {
        let req = wire("GET", "/", &[("Host", "example.tld:443")], b"");
        let record = RequestRecord::from_wire(&req, "https", None).unwrap();
        assert_eq!(record.host, "example.tld");

        let req = wire("GET", "/", &[("Host", "example.tld:8443")], b"");
        let record = RequestRecord::from_wire(&req, "https", None).unwrap();
        assert_eq!(record.host, "example.tld:8443");
    }

    #[test]
    fn connect_authority_is_the_host_fallback() {
        let req = wire("GET", "/p", &[], b"");
        let record = RequestRecord::from_wire(&req, "https", Some("example.tld:443")).unwrap();
        assert_eq!(record.host, "example.tld");
    }

    #[test]
    fn cookies_move_out_of_headers_last_value_wins() {
        let req = wire(
            "GET",
            "/",
            &[
                ("Host", "h"),
                ("Cookie", "session=abc; theme=dark"),
                ("Cookie", "session=xyz"),
            ],
            b"",
        );
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert!(!record.headers.contains_key("Cookie"));
        assert_eq!(record.cookies["session"], "xyz");
        assert_eq!(record.cookies["theme"], "dark");
    }

    #[test]
    fn form_bodies_become_post_params() {
        let req = wire(
            "POST",
            "/p",
            &[
                ("Host", "example.tld"),
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("Content-Length", "7"),
            ],
            b"a=1&b=2",
        );
        let record = RequestRecord::from_wire(&req, "https", None).unwrap();
        let params = record.post_params.as_ref().unwrap();
        assert_eq!(params["a"], vec!["1"]);
        assert_eq!(params["b"], vec!["2"]);
        assert!(record.body.is_none());
    }

    #[test]
    fn non_utf8_bodies_stay_binary() {
        let req = wire(
            "POST",
            "/bin",
            &[("Host", "h"), ("Content-Type", "application/octet-stream")],
            &[0xff, 0xfe, 0x00],
        );
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(
            record.body,
            Some(Body::Binary(vec![0xff, 0xfe, 0x00]))
        );
    }

    #[test]
    fn fragment_stays_on_the_path() {
        let req = wire("GET", "/p?a=1#frag", &[("Host", "h")], b"");
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.path, "/p#frag");
        assert_eq!(record.get_params["a"], vec!["1"]);
    }

    #[test]
    fn header_names_are_canonicalized_and_multi_values_kept() {
        let req = wire(
            "GET",
            "/",
            &[("Host", "h"), ("x-tag", "one"), ("X-TAG", "two")],
            b"",
        );
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.headers["X-Tag"], vec!["one", "two"]);
    }

    #[test]
    fn reconstruction_round_trips_headers_except_host_and_cookie() {
        let req = wire(
            "GET",
            "http://origin:8080/a?x=1",
            &[
                ("Host", "origin:8080"),
                ("User-Agent", "curl/8.0"),
                ("Accept", "text/html"),
                ("Accept", "application/json"),
                ("Cookie", "id=42"),
            ],
            b"",
        );
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        let rebuilt = record.to_wire();

        assert_eq!(rebuilt.method, "GET");
        assert_eq!(rebuilt.target, "/a?x=1");
        assert_eq!(rebuilt.header("host"), Some("origin:8080"));
        assert_eq!(rebuilt.header("cookie"), Some("id=42"));

        let reparsed = RequestRecord::from_wire(&rebuilt, "http", None).unwrap();
        assert_eq!(reparsed.headers, record.headers);
        assert_eq!(reparsed.cookies, record.cookies);
        assert_eq!(reparsed.get_params, record.get_params);
    }

    #[test]
    fn reconstruction_reencodes_form_bodies() {
        let req = wire(
            "POST",
            "/p",
            &[
                ("Host", "h"),
                ("Content-Type", "application/x-www-form-urlencoded"),
            ],
            b"b=2&a=1",
        );
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        let rebuilt = record.to_wire();
        assert_eq!(rebuilt.body, b"a=1&b=2");
    }

    #[test]
    fn origin_uses_scheme_default_ports() {
        let req = wire("GET", "/", &[("Host", "example.tld")], b"");
        let record = RequestRecord::from_wire(&req, "https", None).unwrap();
        assert_eq!(record.origin(), ("example.tld".to_string(), 443));

        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.origin(), ("example.tld".to_string(), 80));

        let req = wire("GET", "/", &[("Host", "example.tld:9000")], b"");
        let record = RequestRecord::from_wire(&req, "http", None).unwrap();
        assert_eq!(record.origin(), ("example.tld".to_string(), 9000));
    }

    #[test]
    fn response_record_captures_status_line() {
        let resp = crate::wire::WireResponse {
            code: 302,
            reason: "Found".to_string(),
            headers: vec![("location".to_string(), "/elsewhere".to_string())],
            body: b"moved".to_vec(),
            raw: Vec::new(),
        };
        let record = ResponseRecord::from_wire("7", &resp);
        assert_eq!(record.request_id, "7");
        assert_eq!(record.code, 302);
        assert_eq!(record.message, "Found");
        assert_eq!(record.headers["Location"], vec!["/elsewhere"]);
        assert_eq!(record.body, Body::Text("moved".to_string()));
    }
}
