use std::time::Duration;

use rand::Rng;
use reqwest::header::{CONTENT_TYPE, COOKIE, ORIGIN};
use reqwest::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use super::batch::{decode_batch, encode_batch, method_ids, RpcCall};
use super::models::Capture;
use super::parsers::capture_from_proto;
use super::session::{GoogleCookies, GoogleSession, SessionTokens};
use super::throttle::RequestThrottle;
use super::{RpcError, StadiaError};
use crate::util::env::{env_opt, env_parse};
use crate::util::proto::Proto;

pub const DEFAULT_BASE_URL: &str = "https://stadia.google.com/";
pub const IMAGE_ORIGIN: &str = "https://lh3.googleusercontent.com/";
pub const RPC_PATH: &str = "/_/CloudcastPortalFeWebUi/data/batchexecute";
/// Page whose `WIZ_global_data` carries the batch signing tokens.
pub const SESSION_PAGE: &str = "settings";
pub const CAPTURES_PAGE_SIZE: u64 = 99;
const CAPTURES_RPC: &str = "CmnEcf";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/86.0.4240.198 Safari/537.36";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Minimum spacing between request starts.
    pub request_interval: Duration,
    pub language: String,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_interval: Duration::from_millis(2718),
            language: "en".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Reads `STADIA_BASE_URL`, `STADIA_REQUEST_INTERVAL_MS`, `STADIA_LANGUAGE`
    /// and `STADIA_USER_AGENT`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_opt("STADIA_BASE_URL").unwrap_or(defaults.base_url),
            request_interval: Duration::from_millis(env_parse(
                "STADIA_REQUEST_INTERVAL_MS",
                defaults.request_interval.as_millis() as u64,
            )),
            language: env_opt("STADIA_LANGUAGE").unwrap_or(defaults.language),
            user_agent: env_opt("STADIA_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

/// Authenticated client for the web app's batch RPC endpoint.
///
/// All requests from one client share a single [`RequestThrottle`]. The
/// session page is fetched lazily, once, and its tokens reused for every batch.
pub struct StadiaClient {
    config: ClientConfig,
    base_url: Url,
    google_id: String,
    cookies: GoogleCookies,
    http: Client,
    throttle: RequestThrottle,
    tokens: OnceCell<SessionTokens>,
    allowed_origins: Vec<url::Origin>,
}

impl StadiaClient {
    pub fn new(session: GoogleSession, config: ClientConfig) -> Result<Self, RpcError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        let base_url = Url::parse(&config.base_url)?;
        let allowed_origins = vec![base_url.origin(), Url::parse(IMAGE_ORIGIN)?.origin()];
        Ok(Self {
            base_url,
            throttle: RequestThrottle::new(config.request_interval),
            config,
            google_id: session.google_id,
            cookies: session.cookies,
            http,
            tokens: OnceCell::new(),
            allowed_origins,
        })
    }

    pub fn google_id(&self) -> &str {
        &self.google_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn resolve(&self, path: &str) -> Result<Url, RpcError> {
        let url = self.base_url.join(path)?;
        if !self.allowed_origins.contains(&url.origin()) {
            return Err(RpcError::DisallowedOrigin(url.to_string()));
        }
        Ok(url)
    }

    /// GET `path` (or POST `form` to it) relative to the base URL and return the body text.
    pub async fn fetch_http(
        &self,
        path: &str,
        form: Option<&[(&str, &str)]>,
    ) -> Result<String, RpcError> {
        let url = self.resolve(path)?;
        self.send(url, form).await
    }

    async fn send(&self, url: Url, form: Option<&[(&str, &str)]>) -> Result<String, RpcError> {
        let origin = self.base_url.origin().ascii_serialization();
        let method = if form.is_some() { "POST" } else { "GET" };
        let mut request = match form {
            Some(_) => self.http.post(url.clone()),
            None => self.http.get(url.clone()),
        }
        .header(COOKIE, self.cookies.header_value())
        .header(ORIGIN, origin);

        if let Some(fields) = form {
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(fields.iter().copied())
                .finish();
            request = request.header(CONTENT_TYPE, FORM_CONTENT_TYPE).body(body);
        }

        self.throttle.wait().await;
        info!(
            method,
            url = %url,
            google_id = %self.google_id,
            "stadia: http request"
        );
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RpcError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_for_log(text, 300),
            });
        }
        Ok(text)
    }

    /// Tokens from the session page; concurrent first callers share one fetch.
    pub async fn session_tokens(&self) -> Result<&SessionTokens, RpcError> {
        self.tokens
            .get_or_try_init(|| async {
                let html = self.fetch_http(SESSION_PAGE, None).await?;
                let tokens = SessionTokens::from_page(&html)?;
                debug!(bl = %tokens.bl, "stadia: session tokens loaded");
                Ok::<_, RpcError>(tokens)
            })
            .await
    }

    /// Send several calls in one HTTP request. Responses come back in call order.
    pub async fn fetch_batch(&self, calls: &[RpcCall]) -> Result<Vec<Proto>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.session_tokens().await?;

        let rpc_ids = method_ids(calls);
        let request_id = rand::thread_rng().gen_range(0..1_000_000u32).to_string();
        let mut url = self.resolve(RPC_PATH)?;
        url.query_pairs_mut()
            .append_pair("rpcids", &rpc_ids)
            .append_pair("f.sid", &tokens.f_sid)
            .append_pair("bl", &tokens.bl)
            .append_pair("hl", &self.config.language)
            .append_pair("_reqid", &request_id)
            .append_pair("rt", "c");

        let f_req = encode_batch(calls);
        debug!(rpc_ids = %rpc_ids, request = %truncate_for_log(f_req.clone(), 500), "stadia: rpc batch");

        let form = [("f.req", f_req.as_str()), ("at", tokens.at.as_str())];
        let text = self.send(url, Some(&form[..])).await?;
        let responses = decode_batch(&text)?;
        if responses.len() != calls.len() {
            return Err(RpcError::ResponseCount {
                expected: calls.len(),
                actual: responses.len(),
            });
        }
        Ok(responses)
    }

    pub async fn fetch_rpc(&self, method: &str, request: Proto) -> Result<Proto, RpcError> {
        let mut responses = self.fetch_batch(&[RpcCall::new(method, request)]).await?;
        responses.pop().ok_or(RpcError::ResponseCount {
            expected: 1,
            actual: 0,
        })
    }

    /// Every capture on the account, newest first, paging until a short page.
    pub async fn fetch_captures(&self) -> Result<Vec<Capture>, StadiaError> {
        let mut captures = Vec::new();
        let mut page_token = Proto::Null;
        loop {
            debug!(page_token = %page_token, "stadia: fetching captures page");
            let request = Proto::array([Proto::array([
                Proto::from(CAPTURES_PAGE_SIZE),
                page_token.clone(),
            ])]);
            let response = self.fetch_rpc(CAPTURES_RPC, request).await?;
            let entries: Vec<&Proto> = response
                .at(0)
                .items()
                .iter()
                .filter(|entry| entry.as_array().is_some())
                .collect();
            for entry in &entries {
                captures.push(capture_from_proto(entry)?);
            }
            page_token = response.at(1).clone();
            debug!(count = entries.len(), "stadia: got captures page");
            if (entries.len() as u64) < CAPTURES_PAGE_SIZE || page_token.is_null() {
                break;
            }
        }
        Ok(captures)
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 server for exercising the client without the network.

    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub method: String,
        pub target: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl Recorded {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    pub type Log = Arc<Mutex<Vec<Recorded>>>;

    /// Serve until the test ends. `respond` maps a request to `(status, body)`.
    pub async fn serve<F>(respond: F) -> (SocketAddr, Log)
    where
        F: Fn(&Recorded) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);
        let task_log = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = read_request(&mut socket).await;
                let (status, body) = respond(&recorded);
                task_log.lock().unwrap().push(recorded);
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (addr, log)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> Recorded {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if n == 0 {
                break buf.len();
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
        Recorded {
            method,
            target,
            headers,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::{serve, Recorded};
    use super::*;
    use crate::database_ops::stadia::batch::wire;
    use crate::database_ops::stadia::session::pages;
    use serde_json::json;

    fn session() -> GoogleSession {
        GoogleSession {
            google_id: "100000000000000000001".into(),
            cookies: GoogleCookies::new("sid", "ssid", "hsid"),
        }
    }

    fn client(addr: std::net::SocketAddr, interval_ms: u64) -> StadiaClient {
        let config = ClientConfig {
            base_url: format!("http://{addr}/"),
            request_interval: Duration::from_millis(interval_ms),
            ..ClientConfig::default()
        };
        StadiaClient::new(session(), config).unwrap()
    }

    fn form_field(body: &str, name: &str) -> Option<String> {
        url::form_urlencoded::parse(body.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn respond_batch(request: &Recorded) -> (u16, String) {
        if request.target.starts_with("/settings") {
            return (200, pages::settings_page());
        }
        let f_req = form_field(&request.body, "f.req").unwrap_or_default();
        let calls: serde_json::Value = serde_json::from_str(&f_req).unwrap();
        let mut envelopes: Vec<serde_json::Value> = calls[0]
            .as_array()
            .unwrap()
            .iter()
            .map(|call| {
                let index: usize = call[3].as_str().unwrap().parse().unwrap();
                wire::envelope(
                    call[0].as_str().unwrap(),
                    &json!([call[0], index]),
                    index,
                )
            })
            .collect();
        envelopes.reverse();
        (200, wire::response_body(&envelopes))
    }

    #[tokio::test]
    async fn batch_is_signed_and_correlated() {
        let (addr, log) = serve(respond_batch).await;
        let client = client(addr, 0);

        let calls = vec![
            RpcCall::new("ZAm7We", Proto::array([Proto::from("g1rcp1")])),
            RpcCall::bare("T2ZnGf"),
            RpcCall::new("FWhQV", Proto::array([Proto::Null, Proto::from("s1")])),
        ];
        let responses = client.fetch_batch(&calls).await.unwrap();
        let methods: Vec<_> = responses.iter().map(|r| r.at(0).as_str().unwrap()).collect();
        assert_eq!(methods, vec!["ZAm7We", "T2ZnGf", "FWhQV"]);

        client.fetch_rpc("T2ZnGf", Proto::array([])).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3, "session page should be fetched once");
        assert_eq!(log[0].method, "GET");
        let batch = &log[1];
        assert_eq!(batch.method, "POST");
        assert!(batch.target.starts_with(RPC_PATH));
        let query = Url::parse(&format!("http://x{}", batch.target)).unwrap();
        let params: std::collections::HashMap<_, _> = query.query_pairs().into_owned().collect();
        assert_eq!(params["rpcids"], "ZAm7We,T2ZnGf,FWhQV");
        assert_eq!(params["f.sid"], "-1234567890123456789");
        assert_eq!(params["hl"], "en");
        assert_eq!(params["rt"], "c");
        assert!(params["_reqid"].parse::<u32>().unwrap() < 1_000_000);
        assert_eq!(form_field(&batch.body, "at").as_deref(), Some("AFoo:1610000000000"));
        assert_eq!(batch.header("cookie"), Some("SID=sid; SSID=ssid; HSID=hsid;"));
        assert_eq!(batch.header("content-type"), Some(FORM_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn empty_batch_makes_no_request() {
        let (addr, log) = serve(respond_batch).await;
        let client = client(addr, 0);
        assert!(client.fetch_batch(&[]).await.unwrap().is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (addr, _log) = serve(|_| (503, "unavailable".to_string())).await;
        let client = client(addr, 0);
        let err = client.fetch_rpc("T2ZnGf", Proto::array([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn refuses_foreign_origins() {
        let (addr, log) = serve(respond_batch).await;
        let client = client(addr, 0);
        let err = client.fetch_http("https://example.com/steal", None).await.unwrap_err();
        assert!(matches!(err, RpcError::DisallowedOrigin(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequential_batches_respect_the_interval() {
        let (addr, _log) = serve(respond_batch).await;
        let interval = Duration::from_millis(50);
        let client = client(addr, interval.as_millis() as u64);

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            client.fetch_batch(&[RpcCall::bare("T2ZnGf")]).await.unwrap();
        }
        // The session page plus three batches: four slots.
        assert!(start.elapsed() >= interval * 3);
    }

    #[tokio::test]
    async fn captures_are_paged_until_a_short_page() {
        fn entry(i: usize) -> serde_json::Value {
            json!([
                null,
                format!("5f1c0f7e-3f52-4f7b-9d43-{:012x}", i),
                ["b2rcp1"],
                "Game",
                [1610000000 + i as i64],
                null,
                null,
                [null, format!("https://lh3.googleusercontent.com/{i}")]
            ])
        }

        let (addr, log) = serve(|request| {
            if request.target.starts_with("/settings") {
                return (200, pages::settings_page());
            }
            let f_req = form_field(&request.body, "f.req").unwrap();
            let payload = if f_req.contains("token-2") {
                json!([[entry(99)], null])
            } else {
                json!([(0..99).map(entry).collect::<Vec<_>>(), "token-2"])
            };
            (200, wire::response_body(&[wire::envelope("CmnEcf", &payload, 1)]))
        })
        .await;
        let client = client(addr, 0);

        let captures = client.fetch_captures().await.unwrap();
        assert_eq!(captures.len(), 100);
        assert_eq!(captures[99].timestamp, 1610000099);
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
