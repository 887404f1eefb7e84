use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::collection::FeedCollection;
use super::fetcher::{FeedFetcher, FetchError};
use super::parser::{parse_feed, DecodeError};
use super::types::{FeedDocument, Source, SourceType};

const DEFAULT_BATCH_DEADLINE: Duration = Duration::from_secs(60);

/// Pipeline step a source was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => f.write_str("fetch"),
            Stage::Decode => f.write_str("decode"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The source's task panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// A source that did not make it into the collection.
#[derive(Debug)]
pub struct FetchFailure {
    pub source: Source,
    pub stage: Stage,
    pub cause: FailureCause,
}

impl FetchFailure {
    fn new(source: Source, stage: Stage, cause: impl Into<FailureCause>) -> Self {
        Self {
            source,
            stage,
            cause: cause.into(),
        }
    }

    fn cancelled(source: Source) -> Self {
        Self::new(source, Stage::Fetch, FetchError::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, FailureCause::Fetch(FetchError::Cancelled))
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}> failed during {}: {}",
            self.source.name, self.source.url, self.stage, self.cause
        )
    }
}

/// Bounds for one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Wall-clock budget for the whole batch, measured from the call.
    pub batch_deadline: Duration,
    /// Cap on sources in flight at once. `None` starts every source
    /// immediately.
    pub max_concurrency: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_deadline: DEFAULT_BATCH_DEADLINE,
            max_concurrency: None,
        }
    }
}

/// Everything a batch produced.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Successfully decoded feeds, in the order their reports arrived.
    pub collection: FeedCollection,
    /// One entry per failed source, in the order failures were observed.
    pub failures: Vec<FetchFailure>,
    /// Sources not attempted because their type is not RSS.
    pub skipped: Vec<Source>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.collection.feeds().len()
    }
}

/// Terminal report of one source task.
struct Report {
    index: usize,
    outcome: Result<FeedDocument, FetchFailure>,
}

/// Fetches and decodes every source concurrently and merges the results.
///
/// One task is spawned per RSS source. Tasks report over a channel sized
/// to the number of sources, so sends never wait, and this function is the
/// channel's only consumer: it alone mutates the collection.
///
/// Per-source errors never abort the batch; they end up in
/// [`BatchOutcome::failures`]. When `options.batch_deadline` elapses,
/// reports already queued are still taken, every other task is aborted
/// (dropping its in-flight request) and recorded as cancelled.
///
/// Tasks live in a [`JoinSet`], so dropping the returned future aborts
/// every fetch still in flight.
pub async fn run_batch(
    fetcher: &FeedFetcher,
    sources: &[Source],
    options: &BatchOptions,
) -> BatchOutcome {
    let deadline = Instant::now() + options.batch_deadline;
    let mut outcome = BatchOutcome::default();

    let mut active = Vec::with_capacity(sources.len());
    for source in sources {
        if source.kind == SourceType::Rss {
            active.push(source.clone());
        } else {
            tracing::warn!(
                source = %source.name,
                kind = ?source.kind,
                "Skipping source: only RSS feeds are supported"
            );
            outcome.skipped.push(source.clone());
        }
    }

    if active.is_empty() {
        return outcome;
    }

    tracing::info!(
        sources = active.len(),
        deadline_ms = options.batch_deadline.as_millis() as u64,
        max_concurrency = ?options.max_concurrency,
        "Starting feed batch"
    );

    let (tx, mut rx) = mpsc::channel::<Report>(active.len());
    let permits = options
        .max_concurrency
        .map(|n| Arc::new(Semaphore::new(n.max(1))));

    let mut tasks = JoinSet::new();
    let mut task_index = HashMap::with_capacity(active.len());
    for (index, source) in active.iter().cloned().enumerate() {
        let tx = tx.clone();
        let fetcher = fetcher.clone();
        let permits = permits.clone();
        let handle = tasks.spawn(async move {
            let result = fetch_and_decode(&fetcher, source, deadline, permits.as_deref()).await;
            // Capacity equals the task count: this never waits, and only
            // fails once the consumer has stopped listening.
            let _ = tx.send(Report { index, outcome: result }).await;
        });
        task_index.insert(handle.id(), index);
    }
    drop(tx);

    let mut reported = vec![false; active.len()];
    let mut pending = active.len();

    while pending > 0 {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(report)) => {
                pending -= 1;
                reported[report.index] = true;
                record(&mut outcome, &active[report.index], report.outcome);
            }
            // Every sender is gone: the remaining tasks panicked.
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    outstanding = pending,
                    "Batch deadline elapsed, cancelling outstanding feeds"
                );
                break;
            }
        }
    }

    rx.close();
    while let Ok(report) = rx.try_recv() {
        reported[report.index] = true;
        record(&mut outcome, &active[report.index], report.outcome);
    }

    // Tasks that already panicked keep their panic error through the abort.
    tasks.abort_all();
    let mut panicked = HashMap::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Err(e) if e.is_panic() => {
                if let Some(&index) = task_index.get(&e.id()) {
                    panicked.insert(index, e.to_string());
                }
            }
            _ => {}
        }
    }

    for (index, source) in active.iter().enumerate() {
        if reported[index] {
            continue;
        }
        let failure = match panicked.remove(&index) {
            Some(message) => {
                FetchFailure::new(source.clone(), Stage::Fetch, FailureCause::Panicked(message))
            }
            None => FetchFailure::cancelled(source.clone()),
        };
        record(&mut outcome, source, Err(failure));
    }

    tracing::info!(
        succeeded = outcome.succeeded(),
        failed = outcome.failures.len(),
        skipped = outcome.skipped.len(),
        items = outcome.collection.items().len(),
        "Feed batch finished"
    );

    outcome
}

fn record(
    outcome: &mut BatchOutcome,
    source: &Source,
    result: Result<FeedDocument, FetchFailure>,
) {
    match result {
        Ok(document) => outcome.collection.collect_from(source, document),
        Err(failure) => {
            tracing::warn!(
                source = %failure.source.name,
                url = %failure.source.url,
                stage = %failure.stage,
                error = %failure.cause,
                "Feed failed"
            );
            outcome.failures.push(failure);
        }
    }
}

/// One source's task: `Pending -> Fetching -> Decoding -> Succeeded | Failed`.
async fn fetch_and_decode(
    fetcher: &FeedFetcher,
    source: Source,
    deadline: Instant,
    permits: Option<&Semaphore>,
) -> Result<FeedDocument, FetchFailure> {
    tracing::debug!(source = %source.name, state = "pending");

    let _permit = match permits {
        Some(semaphore) => match tokio::time::timeout_at(deadline, semaphore.acquire()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => return Err(FetchFailure::cancelled(source)),
        },
        None => None,
    };

    tracing::debug!(source = %source.name, url = %source.url, state = "fetching");
    let payload = match fetcher.fetch(&source.url, deadline).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(source = %source.name, state = "failed", stage = "fetch");
            return Err(FetchFailure::new(source, Stage::Fetch, e));
        }
    };

    tracing::debug!(source = %source.name, bytes = payload.len(), state = "decoding");
    match parse_feed(&payload) {
        Ok(document) => {
            tracing::debug!(
                source = %source.name,
                items = document.items().len(),
                state = "succeeded"
            );
            Ok(document)
        }
        Err(e) => {
            tracing::debug!(source = %source.name, state = "failed", stage = "decode");
            Err(FetchFailure::new(source, Stage::Decode, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::FetcherConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn rss(title: &str, items: &[&str]) -> String {
        let items: String = items
            .iter()
            .map(|t| format!("<item><title>{t}</title><link>https://example.com/{t}</link></item>"))
            .collect();
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\">\
             <channel><title>{title}</title>{items}</channel></rss>"
        )
    }

    fn fetcher() -> FeedFetcher {
        FeedFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(5),
            max_bytes: 1024 * 1024,
        })
        .unwrap()
    }

    async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn source(server: &MockServer, name: &str) -> Source {
        Source::rss(name, format!("{}/{name}", server.uri()))
    }

    #[tokio::test]
    async fn test_mixed_results() {
        let server = MockServer::start().await;
        mount(&server, "/missing", ResponseTemplate::new(404)).await;
        mount(
            &server,
            "/broken",
            ResponseTemplate::new(200).set_body_string("<rss><channel>"),
        )
        .await;
        mount(
            &server,
            "/good",
            ResponseTemplate::new(200).set_body_string(rss("Good Feed", &["one", "two"])),
        )
        .await;

        let sources = vec![
            source(&server, "missing"),
            source(&server, "broken"),
            source(&server, "good"),
        ];
        let outcome = run_batch(&fetcher(), &sources, &BatchOptions::default()).await;

        let by_feed = outcome.collection.by_feed();
        assert_eq!(by_feed.len(), 1);
        assert_eq!(by_feed["Good Feed"].len(), 2);
        assert_eq!(by_feed["Good Feed"][0].title, "one");
        assert_eq!(by_feed["Good Feed"][1].title, "two");

        assert_eq!(outcome.failures.len(), 2);
        let missing = outcome
            .failures
            .iter()
            .find(|f| f.source.name == "missing")
            .unwrap();
        assert_eq!(missing.stage, Stage::Fetch);
        assert!(matches!(
            missing.cause,
            FailureCause::Fetch(FetchError::BadStatus(404))
        ));
        let broken = outcome
            .failures
            .iter()
            .find(|f| f.source.name == "broken")
            .unwrap();
        assert_eq!(broken.stage, Stage::Decode);
        assert!(matches!(
            broken.cause,
            FailureCause::Decode(DecodeError::MalformedXml(_))
        ));
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_source() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(rss("Slow", &["late"]))
                .set_delay(Duration::from_millis(500)),
        )
        .await;
        mount(
            &server,
            "/fast",
            ResponseTemplate::new(200).set_body_string(rss("Fast", &["early"])),
        )
        .await;

        let sources = vec![source(&server, "slow"), source(&server, "fast")];
        let options = BatchOptions {
            batch_deadline: Duration::from_millis(100),
            max_concurrency: None,
        };

        let started = std::time::Instant::now();
        let outcome = run_batch(&fetcher(), &sources, &options).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source.name, "slow");
        assert!(outcome.failures[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_every_source_reports_once() {
        let server = MockServer::start().await;
        let mut sources = Vec::new();
        for n in 0..6 {
            let name = format!("feed{n}");
            let response = if n % 2 == 0 {
                let items = &["a", "b", "c"][..n % 3 + 1];
                ResponseTemplate::new(200).set_body_string(rss(&name, items))
            } else {
                ResponseTemplate::new(500)
            };
            mount(&server, &format!("/{name}"), response).await;
            sources.push(source(&server, &name));
        }

        let outcome = run_batch(&fetcher(), &sources, &BatchOptions::default()).await;

        assert_eq!(outcome.succeeded() + outcome.failures.len(), sources.len());
        assert_eq!(outcome.collection.by_feed().len(), 3);
        let counted: usize = outcome.collection.feeds().iter().map(|f| f.count).sum();
        assert_eq!(counted, outcome.collection.items().len());
    }

    /// Records when each request arrives and answers after `delay`.
    struct ArrivalLog {
        arrivals: Arc<Mutex<Vec<std::time::Instant>>>,
        body: String,
        delay: Duration,
    }

    impl Respond for ArrivalLog {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(std::time::Instant::now());
            ResponseTemplate::new(200)
                .set_body_string(self.body.clone())
                .set_delay(self.delay)
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_bounds_in_flight_requests() {
        let server = MockServer::start().await;
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_millis(200);
        let mut sources = Vec::new();
        for n in 0..5 {
            let name = format!("capped{n}");
            Mock::given(method("GET"))
                .and(path(format!("/{name}")))
                .respond_with(ArrivalLog {
                    arrivals: Arc::clone(&arrivals),
                    body: rss(&name, &["x"]),
                    delay,
                })
                .mount(&server)
                .await;
            sources.push(source(&server, &name));
        }

        let options = BatchOptions {
            batch_deadline: Duration::from_secs(5),
            max_concurrency: Some(2),
        };
        let started = std::time::Instant::now();
        let outcome = run_batch(&fetcher(), &sources, &options).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.succeeded(), 5);
        assert!(outcome.failures.is_empty());
        // Five sources two at a time take three rounds.
        assert!(elapsed >= delay * 3, "took {elapsed:?}");

        // A request can only start once an earlier one has answered, so no
        // more than two arrive within one delay of each other.
        let mut arrivals = arrivals.lock().unwrap().clone();
        arrivals.sort();
        assert_eq!(arrivals.len(), 5);
        let peak = arrivals
            .iter()
            .enumerate()
            .map(|(i, at)| {
                arrivals[..=i]
                    .iter()
                    .filter(|earlier| at.duration_since(**earlier) < delay / 2)
                    .count()
            })
            .max()
            .unwrap();
        assert!(peak <= 2, "{peak} requests in flight at once");
    }

    #[tokio::test]
    async fn test_permit_wait_counts_against_deadline() {
        let server = MockServer::start().await;
        let mut sources = Vec::new();
        for n in 0..3 {
            let name = format!("queued{n}");
            mount(
                &server,
                &format!("/{name}"),
                ResponseTemplate::new(200)
                    .set_body_string(rss(&name, &["x"]))
                    .set_delay(Duration::from_millis(200)),
            )
            .await;
            sources.push(source(&server, &name));
        }

        let options = BatchOptions {
            batch_deadline: Duration::from_millis(300),
            max_concurrency: Some(1),
        };
        let started = std::time::Instant::now();
        let outcome = run_batch(&fetcher(), &sources, &options).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(FetchFailure::is_cancelled));
    }

    #[tokio::test]
    async fn test_dropping_batch_aborts_pending_fetches() {
        let server = MockServer::start().await;
        let mut sources = Vec::new();
        for n in 0..3 {
            let name = format!("dropped{n}");
            mount(
                &server,
                &format!("/{name}"),
                ResponseTemplate::new(200)
                    .set_body_string(rss(&name, &["x"]))
                    .set_delay(Duration::from_millis(100)),
            )
            .await;
            sources.push(source(&server, &name));
        }

        let options = BatchOptions {
            batch_deadline: Duration::from_secs(5),
            max_concurrency: Some(1),
        };
        let fetcher = fetcher();
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            run_batch(&fetcher, &sources, &options),
        )
        .await;
        assert!(dropped.is_err());

        // Detached tasks would have gone on to request the queued sources.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let requests = server.received_requests().await.unwrap();
        assert!(requests.len() <= 1, "{} requests after drop", requests.len());
    }

    #[tokio::test]
    async fn test_non_rss_sources_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sources = vec![Source {
            name: "atom".into(),
            url: server.uri(),
            kind: SourceType::Atom,
        }];
        let outcome = run_batch(&fetcher(), &sources, &BatchOptions::default()).await;

        assert!(outcome.collection.is_empty());
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.skipped, sources);
    }

    #[tokio::test]
    async fn test_empty_source_list() {
        let outcome = run_batch(&fetcher(), &[], &BatchOptions::default()).await;
        assert!(outcome.collection.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_failure_display() {
        let failure = FetchFailure::new(
            Source::rss("Example", "https://example.com/feed"),
            Stage::Fetch,
            FetchError::BadStatus(404),
        );
        assert_eq!(
            failure.to_string(),
            "Example <https://example.com/feed> failed during fetch: HTTP error: status 404"
        );
    }
}
