use http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Method;
use std::borrow::Cow;
use std::collections::HashMap;

pub(crate) trait Request {
    const METHOD: Method = Method::GET;

    fn endpoint(&self) -> Cow<'_, str>;

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers
    }

    fn body(&self) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Download {
    pub bytes: u64,
}

impl Request for Download {
    fn endpoint(&self) -> Cow<'_, str> {
        format!("__down?bytes={}", self.bytes).into()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Upload {
    pub bytes: u64,
}

impl Request for Upload {
    const METHOD: Method = Method::POST;

    fn endpoint(&self) -> Cow<'_, str> {
        "__up".into()
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        headers
    }

    fn body(&self) -> Option<Vec<u8>> {
        Some(vec![b'0'; self.bytes as usize])
    }
}

pub(crate) struct TraceRequest;

impl Request for TraceRequest {
    fn endpoint(&self) -> Cow<'_, str> {
        "cdn-cgi/trace".into()
    }
}

/// The interesting subset of `cdn-cgi/trace`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub ip: String,
    pub colo: String,
    pub loc: String,
}

impl Trace {
    /// Parses the `key=value` per line body.
    pub fn parse(body: &str) -> Self {
        let fields: HashMap<&str, &str> = body
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let field = |name: &str| fields.get(name).map(|v| v.to_string()).unwrap_or_default();

        Self { ip: field("ip"), colo: field("colo"), loc: field("loc") }
    }
}

/// Extracts the server processing time in milliseconds from a
/// `server-timing` header such as `cfRequestDuration;dur=12.5`.
pub(crate) fn parse_server_timing(header: &str) -> Option<f64> {
    header
        .split([';', ','])
        .filter_map(|part| part.trim().strip_prefix("dur="))
        .find_map(|ms| ms.parse::<f64>().ok())
        .filter(|ms| ms.is_finite())
}
