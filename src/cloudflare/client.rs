use crate::cloudflare::requests::{parse_server_timing, Request, Trace, TraceRequest};
use crate::errors::MonitorError;
use http::header::HeaderName;
use reqwest::Client as ReqwestClient;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

pub(crate) static BASE_URL: &str = "https://speed.cloudflare.com/";

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const REPO: &str = env!("CARGO_PKG_REPOSITORY");

const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");

/// Timing breakdown of one HTTP exchange.
///
/// All offsets are measured from the moment the request was handed to the
/// connection pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Body bytes received (downloads) or sent (uploads).
    pub bytes: u64,
    /// Until the response headers arrived.
    pub ttfb: Duration,
    /// Until the last body byte arrived.
    pub end: Duration,
    /// Processing time reported by the server.
    pub server_time: Duration,
}

impl Timing {
    /// Round trip with the server's own processing removed.
    pub fn latency_ms(&self) -> f64 {
        millis(self.ttfb.saturating_sub(self.server_time))
    }

    /// Time spent moving the response body.
    pub fn download_ms(&self) -> f64 {
        millis(self.end.saturating_sub(self.ttfb))
    }

    /// Time spent moving the request body, less server processing.
    pub fn upload_ms(&self) -> f64 {
        millis(self.ttfb.saturating_sub(self.server_time))
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Server processing time reported in the `server-timing` header.
/// Values that do not fit a `Duration` count as zero.
fn server_duration(ms: f64) -> Duration {
    Duration::try_from_secs_f64(ms.max(0.0) / 1000.0).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone)]
pub struct Client {
    client: ReqwestClient,
    base: Url,
}

impl Client {
    pub fn new() -> Result<Self, MonitorError> {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base: &str) -> Result<Self, MonitorError> {
        let base = Url::parse(base).map_err(|e| {
            MonitorError::config(format!("Invalid speed test URL '{}'", base))
                .with_source(e)
        })?;

        let client = ReqwestClient::builder()
            .user_agent(format!("{}/{} ({})", NAME, VERSION, REPO))
            .build()?;

        Ok(Client { client, base })
    }

    fn url<R: Request>(&self, request: &R) -> Result<Url, MonitorError> {
        let endpoint = request.endpoint();
        self.base.join(endpoint.trim_start_matches('/')).map_err(|e| {
            MonitorError::config(format!("Invalid endpoint '{}'", endpoint))
                .with_source(e)
        })
    }

    /// Sends a request and times it, streaming the response body so large
    /// downloads are never buffered.
    pub(crate) async fn send<R: Request>(
        &self,
        request: &R,
    ) -> Result<Timing, MonitorError> {
        let url = self.url(request)?;
        let body = request.body();
        let sent = body.as_ref().map(|b| b.len() as u64);

        let mut builder = self
            .client
            .request(R::METHOD, url)
            .headers(request.headers());
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let begin = Instant::now();
        let mut response = builder.send().await?.error_for_status()?;
        let ttfb = begin.elapsed();

        let server_time = response
            .headers()
            .get(SERVER_TIMING)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_server_timing)
            .map(server_duration)
            .unwrap_or(Duration::ZERO);

        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await? {
            received += chunk.len() as u64;
        }
        let end = begin.elapsed();

        Ok(Timing { bytes: sent.unwrap_or(received), ttfb, end, server_time })
    }

    pub async fn trace(&self) -> Result<Trace, MonitorError> {
        let url = self.url(&TraceRequest)?;
        let text = self
            .client
            .get(url)
            .headers(TraceRequest.headers())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(Trace::parse(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::requests::{Download, Upload};

    #[test]
    fn test_timing_breakdown() {
        let timing = Timing {
            bytes: 1_000,
            ttfb: Duration::from_millis(50),
            end: Duration::from_millis(250),
            server_time: Duration::from_millis(10),
        };
        assert_eq!(timing.latency_ms(), 40.0);
        assert_eq!(timing.download_ms(), 200.0);
        assert_eq!(timing.upload_ms(), 40.0);
    }

    #[test]
    fn test_server_duration() {
        assert_eq!(server_duration(500.0), Duration::from_millis(500));
        assert_eq!(server_duration(-3.0), Duration::ZERO);
        assert_eq!(server_duration(f64::INFINITY), Duration::ZERO);
        assert_eq!(server_duration(f64::NAN), Duration::ZERO);
        assert_eq!(server_duration(1e300), Duration::ZERO);
    }

    #[test]
    fn test_urls() {
        let client = Client::new().unwrap();
        assert_eq!(
            client.url(&Download { bytes: 0 }).unwrap().as_str(),
            "https://speed.cloudflare.com/__down?bytes=0"
        );
        assert_eq!(
            client.url(&Upload { bytes: 10 }).unwrap().as_str(),
            "https://speed.cloudflare.com/__up"
        );
        assert_eq!(
            client.url(&TraceRequest).unwrap().as_str(),
            "https://speed.cloudflare.com/cdn-cgi/trace"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let error = Client::with_base_url("not a url").unwrap_err();
        assert_eq!(error.kind, crate::errors::ErrorKind::Config);
    }
}
