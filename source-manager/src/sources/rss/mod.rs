//! RSS 2.0 / Atom poller.
//!
//! The first successful poll after `connect()` only records what is already
//! in the feed; later polls emit `"new_item"` for identifiers not seen before.

pub mod parser;
mod seen;

use self::parser::{FeedItem, FeedParser};
use self::seen::SeenSet;
use super::core::{into_object, SourceCore};
use super::TaskSlot;
use crate::source::EventSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sourcebus::{SourceConfig, SourceError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RssOptions {
    url: Option<String>,
    interval: Option<Value>,
    #[serde(default)]
    immediate: bool,
    #[serde(default)]
    headers: HashMap<String, String>,
    max_items: Option<usize>,
}

/// Milliseconds as a number, or a duration string.
fn parse_interval(value: Option<&Value>) -> Result<Duration, SourceError> {
    let invalid = |reason: String| SourceError::InvalidOption {
        option: "interval".to_string(),
        reason,
    };

    let interval = match value {
        None | Some(Value::Null) => return Ok(DEFAULT_POLL_INTERVAL),
        Some(Value::Number(ms)) => ms
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| invalid(format!("{} is not a whole number of milliseconds", ms)))?,
        Some(Value::String(text)) => {
            humantime::parse_duration(text.trim()).map_err(|e| invalid(e.to_string()))?
        }
        Some(other) => return Err(invalid(format!("unsupported value {}", other))),
    };

    if interval.is_zero() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(interval)
}

#[derive(Debug, Default)]
struct PollState {
    seen: SeenSet,
    /// Set once the first successful poll has seeded `seen`
    primed: bool,
}

pub struct RssSource {
    core: Arc<SourceCore>,
    url: String,
    interval: Duration,
    immediate: bool,
    max_items: Option<usize>,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    state: Mutex<PollState>,
    poller: TaskSlot,
}

impl RssSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: RssOptions = config.decode_options()?;
        let url = config.require("url", &options.url)?.to_string();
        let interval = parse_interval(options.interval.as_ref())?;

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            url,
            interval,
            immediate: options.immediate,
            max_items: options.max_items,
            headers: options.headers,
            http: reqwest::Client::new(),
            state: Mutex::new(PollState::default()),
            poller: TaskSlot::default(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of identifiers currently remembered.
    pub fn seen_count(&self) -> usize {
        self.state().seen.len()
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let mut request = self.http.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let body = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", self.url))?
            .error_for_status()?
            .text()
            .await
            .context("Failed to read feed body")?;

        let feed = FeedParser::new()?.parse(&body)?;
        debug!(source_id = %self.core.id(), format = ?feed.format, items = feed.items.len(), "Feed fetched");
        Ok(feed.items)
    }

    /// Fetches once and emits whatever is new. Failures become error signals.
    pub async fn poll(&self) {
        match self.fetch().await {
            Ok(items) => {
                let emitted = self.process(items);
                if emitted > 0 {
                    info!(source_id = %self.core.id(), new_items = emitted, "New feed items");
                }
            }
            Err(e) => {
                error!(source_id = %self.core.id(), error = %e, "Feed poll failed");
                self.core.emit_error(format!("poll failed: {:#}", e));
            }
        }
    }

    /// Marks every identifiable item seen and emits the unseen ones, in
    /// document order, up to `maxItems`. Returns how many were emitted.
    fn process(&self, items: Vec<FeedItem>) -> usize {
        let fresh: Vec<FeedItem> = {
            let mut state = self.state();
            let seeding = !state.primed;
            state.primed = true;

            items
                .into_iter()
                .filter(|item| match item.key() {
                    Some(key) => state.seen.insert(key) && !seeding,
                    None => false,
                })
                .collect()
        };

        let limit = self.max_items.unwrap_or(usize::MAX);
        let mut emitted = 0;
        for item in fresh.into_iter().take(limit) {
            let data = into_object(item.to_data(&self.url), "data");
            if self.core.emit_event("new_item", data, None) {
                emitted += 1;
            }
        }
        emitted
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            ticker.tick().await;
            self.poll().await;
        }
    }
}

#[async_trait]
impl EventSource for RssSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;
        {
            let mut state = self.state();
            state.seen.clear();
            state.primed = false;
        }
        self.core.mark_connected();
        info!(
            source_id = %self.core.id(),
            url = %self.url,
            interval_ms = self.interval.as_millis() as u64,
            "Feed polling started"
        );

        if self.immediate {
            self.poll().await;
        }
        self.core.ensure_active()?;

        self.poller.set(tokio::spawn(Arc::clone(&self).run()));
        Ok(())
    }

    async fn disconnect(&self) {
        self.poller.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceSignal;
    use serde_json::json;
    use sourcebus::{Event, SourceKind};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn feed(items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(guid, title)| {
                format!("<item><guid>{}</guid><title>{}</title></item>", guid, title)
            })
            .collect();
        format!("<?xml version=\"1.0\"?><rss version=\"2.0\"><channel>{}</channel></rss>", items)
    }

    fn rss_config(url: String) -> SourceConfig {
        SourceConfig::new(SourceKind::Rss, "blog").with_option("url", url)
    }

    fn events(rx: &mut UnboundedReceiver<SourceSignal>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let SourceSignal::Event(event) = signal {
                out.push(event);
            }
        }
        out
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(parse_interval(None).unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval(Some(&json!(60000))).unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval(Some(&json!("30s"))).unwrap(), Duration::from_secs(30));
        assert!(parse_interval(Some(&json!(0))).is_err());
        assert!(parse_interval(Some(&json!("often"))).is_err());
        assert!(parse_interval(Some(&json!(true))).is_err());
    }

    #[test]
    fn test_url_is_required() {
        assert_eq!(
            RssSource::new(SourceConfig::new(SourceKind::Rss, "blog")).err(),
            Some(SourceError::MissingOption {
                kind: SourceKind::Rss,
                option: "url"
            })
        );
    }

    #[test]
    fn test_first_batch_seeds_without_emitting() {
        let source = RssSource::new(rss_config("https://example.com/feed".to_string())).unwrap();
        let mut rx = source.take_signals().unwrap();

        let first = vec![
            FeedItem { guid: Some("1".into()), ..FeedItem::default() },
            FeedItem { guid: Some("2".into()), ..FeedItem::default() },
        ];
        assert_eq!(source.process(first), 0);
        assert!(events(&mut rx).is_empty());
        assert_eq!(source.seen_count(), 2);

        let second = vec![
            FeedItem { guid: Some("3".into()), title: Some("three".into()), ..FeedItem::default() },
            FeedItem { guid: Some("1".into()), ..FeedItem::default() },
        ];
        assert_eq!(source.process(second), 1);

        let emitted = events(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type, "new_item");
        assert_eq!(emitted[0].data["guid"], "3");
        assert_eq!(emitted[0].data["title"], "three");
        assert_eq!(emitted[0].data["feedUrl"], "https://example.com/feed");
    }

    #[test]
    fn test_items_without_identity_are_skipped() {
        let source = RssSource::new(rss_config("https://example.com/feed".to_string())).unwrap();
        source.process(Vec::new());

        let emitted = source.process(vec![FeedItem {
            description: Some("anonymous".into()),
            ..FeedItem::default()
        }]);
        assert_eq!(emitted, 0);
        assert_eq!(source.seen_count(), 0);
    }

    #[test]
    fn test_max_items_caps_emission_but_marks_all_seen() {
        let config = rss_config("https://example.com/feed".to_string()).with_option("maxItems", 2);
        let source = RssSource::new(config).unwrap();
        let mut rx = source.take_signals().unwrap();
        source.process(Vec::new());

        let batch: Vec<FeedItem> = (0..5)
            .map(|i| FeedItem { guid: Some(format!("g{}", i)), ..FeedItem::default() })
            .collect();
        assert_eq!(source.process(batch.clone()), 2);

        let emitted = events(&mut rx);
        assert_eq!(emitted[0].data["guid"], "g0");
        assert_eq!(emitted[1].data["guid"], "g1");

        // Capped items were still recorded
        assert_eq!(source.process(batch), 0);
    }

    #[tokio::test]
    async fn test_poll_against_server() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_header("content-type", "application/rss+xml")
            .with_body(feed(&[("a", "A"), ("b", "B")]))
            .create_async()
            .await;

        let source = RssSource::new(rss_config(format!("{}/feed.xml", server.url()))).unwrap();
        let mut rx = source.take_signals().unwrap();

        source.poll().await;
        assert!(events(&mut rx).is_empty());
        first.assert_async().await;
        first.remove_async().await;

        server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_body(feed(&[("c", "C"), ("a", "A"), ("b", "B")]))
            .create_async()
            .await;

        source.poll().await;
        let emitted = events(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data["title"], "C");
    }

    #[tokio::test]
    async fn test_poll_failure_is_an_error_signal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/feed.xml")
            .with_status(500)
            .create_async()
            .await;

        let source = RssSource::new(rss_config(format!("{}/feed.xml", server.url()))).unwrap();
        let mut rx = source.take_signals().unwrap();

        source.poll().await;
        match rx.try_recv().unwrap() {
            SourceSignal::Error { source, message } => {
                assert_eq!(source, "blog");
                assert!(message.starts_with("poll failed"));
            }
            other => panic!("expected error signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_resets_seen_set() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_body(feed(&[("a", "A")]))
            .create_async()
            .await;

        let config = rss_config(format!("{}/feed.xml", server.url())).with_option("immediate", true);
        let source = Arc::new(RssSource::new(config).unwrap());
        let mut rx = source.take_signals().unwrap();

        source.clone().connect().await.unwrap();
        assert_eq!(source.seen_count(), 1);

        source.disconnect().await;
        source.clone().connect().await.unwrap();
        // Reconnecting re-seeds instead of replaying
        assert_eq!(source.seen_count(), 1);
        assert!(events(&mut rx).is_empty());

        source.stop().await;
    }
}
