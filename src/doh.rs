//! DoH Client: a pool of DNS-over-HTTPS resolvers with
//! race-to-first-success and A/NS pool separation.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::time::timeout;

/// Capability interface the classifier resolves signals through. Lets
/// tests substitute an in-memory fake instead of a live resolver pool.
#[async_trait]
pub trait DohResolver: Send + Sync {
    async fn resolve_a(&self, domain: &str) -> Vec<Ipv4Addr>;
    async fn resolve_ns(&self, domain: &str) -> Vec<String>;
}

/// Per-endpoint request timeout.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall pool timeout, across all racing endpoints.
const POOL_TIMEOUT: Duration = Duration::from_secs(8);

const CONTENT_TYPE_DNS_MESSAGE: &str = "application/dns-message";

/// One named DoH endpoint within a pool.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

/// A named pool of DoH endpoints, all queried the same way for a given
/// resolution. Order within the pool carries no semantic meaning — every
/// endpoint is raced in parallel.
#[derive(Debug, Clone)]
pub struct ResolverPool {
    endpoints: Vec<Endpoint>,
    client: reqwest::Client,
}

impl ResolverPool {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ENDPOINT_TIMEOUT)
            .build()
            .expect("failed to build DoH HTTP client");
        Self { endpoints, client }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Race every endpoint for an A-record answer; first syntactically
    /// valid `rcode = 0` response with at least one A record wins.
    pub async fn resolve_a(&self, domain: &str) -> Vec<Ipv4Addr> {
        self.race(domain, RecordType::A)
            .await
            .map(|msg| extract_a(&msg))
            .unwrap_or_default()
    }

    /// Race every endpoint for an NS-record answer.
    pub async fn resolve_ns(&self, domain: &str) -> Vec<String> {
        self.race(domain, RecordType::NS)
            .await
            .map(|msg| extract_ns(&msg))
            .unwrap_or_default()
    }

    async fn race(&self, domain: &str, rtype: RecordType) -> Option<Message> {
        if self.endpoints.is_empty() {
            return None;
        }
        let name = Name::from_ascii(format!("{domain}.")).ok()?;
        let query = build_query(name, rtype);
        let wire = query.to_vec().ok()?;

        let futures = self
            .endpoints
            .iter()
            .map(|ep| exchange(&self.client, ep, wire.clone(), rtype));

        match timeout(POOL_TIMEOUT, race_first_ok(futures)).await {
            Ok(Some(msg)) => Some(msg),
            _ => None,
        }
    }
}

#[async_trait]
impl DohResolver for ResolverPool {
    async fn resolve_a(&self, domain: &str) -> Vec<Ipv4Addr> {
        self.resolve_a(domain).await
    }

    async fn resolve_ns(&self, domain: &str) -> Vec<String> {
        self.resolve_ns(domain).await
    }
}

fn build_query(name: Name, rtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(0);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, rtype));
    msg
}

/// Race an iterator of futures, returning the first `Some`. Siblings are
/// dropped (best-effort cancellation) once a winner is found.
async fn race_first_ok<F>(futures: impl IntoIterator<Item = F>) -> Option<Message>
where
    F: std::future::Future<Output = Option<Message>>,
{
    use futures_lite_select::select_ok_some;
    select_ok_some(futures).await
}

/// Query one endpoint. Returns `Some` only on a winning response: HTTP
/// success, `rcode = 0`, and at least one answer of the requested type —
/// anything else (transport failure, non-zero rcode, empty answer) yields
/// `None` so a sibling endpoint still in the race can win instead.
async fn exchange(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    wire: Vec<u8>,
    rtype: RecordType,
) -> Option<Message> {
    let resp = timeout(
        ENDPOINT_TIMEOUT,
        client
            .post(&endpoint.url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_DNS_MESSAGE)
            .header(reqwest::header::ACCEPT, CONTENT_TYPE_DNS_MESSAGE)
            .body(wire)
            .send(),
    )
    .await
    .ok()?
    .ok()?;

    if !resp.status().is_success() {
        return None;
    }
    let body = resp.bytes().await.ok()?;
    let msg = Message::from_vec(&body).ok()?;
    if msg.response_code() != ResponseCode::NoError {
        return None;
    }
    let has_answer = msg
        .answers()
        .iter()
        .any(|r| r.record_type() == rtype);
    if !has_answer {
        return None;
    }
    Some(msg)
}

fn extract_a(msg: &Message) -> Vec<Ipv4Addr> {
    if msg.response_code() != ResponseCode::NoError {
        return Vec::new();
    }
    msg.answers()
        .iter()
        .filter_map(record_a)
        .collect()
}

fn extract_ns(msg: &Message) -> Vec<String> {
    if msg.response_code() != ResponseCode::NoError {
        return Vec::new();
    }
    msg.answers()
        .iter()
        .filter_map(record_ns)
        .collect()
}

fn record_a(record: &Record) -> Option<Ipv4Addr> {
    match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    }
}

fn record_ns(record: &Record) -> Option<String> {
    match record.data() {
        Some(RData::NS(name)) => Some(name.to_utf8().trim_end_matches('.').to_ascii_lowercase()),
        _ => None,
    }
}

/// Minimal "race N futures, keep the first `Some`, drop the rest" helper.
///
/// Implemented locally rather than pulling in a combinator crate: each
/// future is spawned as its own task so losing branches are dropped
/// (best-effort cancellation) the moment a winner resolves.
mod futures_lite_select {
    use hickory_proto::op::Message;

    pub async fn select_ok_some<F>(futures: impl IntoIterator<Item = F>) -> Option<Message>
    where
        F: std::future::Future<Output = Option<Message>>,
    {
        let mut set = tokio::task::JoinSet::new();
        for fut in futures {
            set.spawn(fut);
        }
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(msg)) = joined {
                set.abort_all();
                return Some(msg);
            }
        }
        None
    }
}

/// Parse `name=url` or bare `url` pool entries, comma-separated (the
/// `doh_A`/`doh_NS` config shape).
pub fn parse_pool(raw: &str, default_name_prefix: &str) -> Vec<Endpoint> {
    let mut out = Vec::new();
    for (idx, part) in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).enumerate() {
        let (name, url) = match part.split_once('=') {
            Some((n, u)) if !n.trim().is_empty() => (n.trim().to_string(), u.trim()),
            _ => (format!("{default_name_prefix}{idx}"), part),
        };
        if !url.starts_with("https://") {
            tracing::warn!(url, "ignoring non-https DoH endpoint");
            continue;
        }
        out.push(Endpoint {
            name,
            url: url.to_string(),
        });
    }
    out
}
