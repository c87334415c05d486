//! Request/response access to the chain: head height and filtered logs.
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::events::{event_topics, lower_hex};

/// Chain data the pull strategy needs.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Current head block height.
    async fn head(&self) -> anyhow::Result<u64>;

    /// Logs emitted by `address` matching either consumed topic, in `from..=to`.
    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>>;
}

#[async_trait]
impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    async fn head(&self) -> anyhow::Result<u64> {
        (**self).head().await
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        (**self).logs(address, from, to).await
    }
}

/// Filter for one token contract over an inclusive block range, either topic.
pub fn log_filter(address: Address, from: u64, to: u64) -> Filter {
    Filter::new()
        .address(address)
        .event_signature(event_topics().to_vec())
        .from_block(from)
        .to_block(to)
}

/// One HTTP JSON-RPC endpoint.
#[derive(Clone)]
pub struct HttpEndpoint {
    provider: DynProvider,
}

impl HttpEndpoint {
    /// Connect lazily to `url`.
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let url = url.parse().map_err(|e| anyhow!("invalid RPC URL {url}: {e}"))?;
        Ok(Self {
            provider: ProviderBuilder::new().connect_http(url).erased(),
        })
    }
}

#[async_trait]
impl LogSource for HttpEndpoint {
    async fn head(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        Ok(self.provider.get_logs(&log_filter(address, from, to)).await?)
    }
}

/// An ordered list of endpoints acting as one [`LogSource`].
///
/// Every request goes to the first endpoint; on failure the identical request is retried
/// against the next one, and so on. Only when all of them fail does the request fail, with
/// each endpoint's error in the message.
#[derive(Clone)]
pub struct FallbackRpc<S = HttpEndpoint> {
    endpoints: Vec<(String, S)>,
}

impl<S> std::fmt::Debug for FallbackRpc<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let urls: Vec<&str> = self.urls().collect();
        f.debug_struct("FallbackRpc").field("endpoints", &urls).finish()
    }
}

impl FallbackRpc<HttpEndpoint> {
    /// Connect lazily to each URL, preserving order. At least one URL is required.
    pub fn new<I, U>(urls: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let endpoints = urls
            .into_iter()
            .map(|url| {
                let url = url.as_ref().trim();
                Ok((url.to_string(), HttpEndpoint::connect(url)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::from_endpoints(endpoints)
    }
}

impl<S> FallbackRpc<S> {
    /// Use already-built endpoints, each labelled for logs and errors. At least one is required.
    pub fn from_endpoints(endpoints: Vec<(String, S)>) -> anyhow::Result<Self> {
        if endpoints.is_empty() {
            bail!("no RPC endpoints configured");
        }
        Ok(Self { endpoints })
    }

    /// Endpoint labels in the order they are tried.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|(u, _)| u.as_str())
    }

    fn all_failed(&self, what: &str, failures: Vec<String>) -> anyhow::Error {
        anyhow!(
            "{what} failed on all {} endpoints: {}",
            self.endpoints.len(),
            failures.join("; ")
        )
    }
}

fn note_failure(failures: &mut Vec<String>, what: &str, url: &str, e: anyhow::Error) {
    tracing::warn!(endpoint = %url, error = %e, "{what} failed, trying next endpoint");
    failures.push(format!("{url}: {e:#}"));
}

#[async_trait]
impl<S: LogSource> LogSource for FallbackRpc<S> {
    async fn head(&self) -> anyhow::Result<u64> {
        let what = "eth_blockNumber";
        let mut failures = Vec::with_capacity(self.endpoints.len());
        for (url, endpoint) in &self.endpoints {
            match endpoint.head().await {
                Ok(head) => return Ok(head),
                Err(e) => note_failure(&mut failures, what, url, e),
            }
        }
        Err(self.all_failed(what, failures))
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        let what = format!("eth_getLogs({} {from}..={to})", lower_hex(&address));
        let mut failures = Vec::with_capacity(self.endpoints.len());
        for (url, endpoint) in &self.endpoints {
            match endpoint.logs(address, from, to).await {
                Ok(logs) => return Ok(logs),
                Err(e) => note_failure(&mut failures, &what, url, e),
            }
        }
        Err(self.all_failed(&what, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubEndpoint {
        down: Option<&'static str>,
        head: u64,
        calls: AtomicUsize,
        queries: Mutex<Vec<(Address, u64, u64)>>,
    }

    impl StubEndpoint {
        fn up(head: u64) -> Self {
            Self { head, ..Default::default() }
        }
        fn down(reason: &'static str) -> Self {
            Self { down: Some(reason), ..Default::default() }
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSource for StubEndpoint {
        async fn head(&self) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.down {
                Some(reason) => bail!(reason),
                None => Ok(self.head),
            }
        }

        async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push((address, from, to));
            match self.down {
                Some(reason) => bail!(reason),
                None => Ok(vec![Log::default()]),
            }
        }
    }

    fn chain(endpoints: Vec<(&str, Arc<StubEndpoint>)>) -> FallbackRpc<Arc<StubEndpoint>> {
        FallbackRpc::from_endpoints(
            endpoints
                .into_iter()
                .map(|(url, e)| (url.to_string(), e))
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failed_request_is_repeated_on_next_endpoint() -> anyhow::Result<()> {
        let a = Arc::new(StubEndpoint::down("connection refused"));
        let b = Arc::new(StubEndpoint::up(105));
        let c = Arc::new(StubEndpoint::up(999));
        let rpc = chain(vec![("a", a.clone()), ("b", b.clone()), ("c", c.clone())]);

        assert_eq!(rpc.head().await?, 105);

        let token = Address::repeat_byte(0x7a);
        let logs = rpc.logs(token, 101, 105).await?;
        assert_eq!(logs.len(), 1);
        assert_eq!(*a.queries.lock().unwrap(), [(token, 101, 105)]);
        assert_eq!(*b.queries.lock().unwrap(), [(token, 101, 105)]);

        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 2);
        assert_eq!(c.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_endpoints_report_every_cause() {
        let rpc = chain(vec![
            ("https://a.example", Arc::new(StubEndpoint::down("connection refused"))),
            ("https://b.example", Arc::new(StubEndpoint::down("rate limited"))),
        ]);

        let err = rpc.head().await.unwrap_err().to_string();
        assert!(err.contains("all 2 endpoints"), "{err}");
        assert!(err.contains("https://a.example: connection refused"), "{err}");
        assert!(err.contains("https://b.example: rate limited"), "{err}");

        let err = rpc
            .logs(Address::repeat_byte(0x7a), 1, 2)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("eth_getLogs"), "{err}");
        assert!(err.contains("connection refused") && err.contains("rate limited"), "{err}");
    }

    #[test]
    fn rejects_empty_and_malformed_endpoint_lists() {
        assert!(FallbackRpc::new(Vec::<String>::new()).is_err());
        assert!(FallbackRpc::new(["not a url"]).is_err());
    }

    #[test]
    fn keeps_endpoint_order() {
        let rpc = FallbackRpc::new(["https://a.example", "https://b.example"]).unwrap();
        let urls: Vec<&str> = rpc.urls().collect();
        assert_eq!(urls, ["https://a.example", "https://b.example"]);
    }

    #[test]
    fn filter_targets_one_address_and_both_topics() {
        let addr = Address::repeat_byte(0x42);
        let filter = log_filter(addr, 101, 105);
        assert_eq!(filter.get_from_block(), Some(101));
        assert_eq!(filter.get_to_block(), Some(105));
        assert!(filter.address.matches(&addr));
        for topic in event_topics() {
            assert!(filter.topics[0].matches(&topic));
        }
    }
}
