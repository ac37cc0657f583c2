use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use uuid::Uuid;

use crawlq::dead_letter::{DeadLetterConfig, DeadLetterQueue};
use crawlq::discovery::StaticDiscoverer;
use crawlq::heartbeat::{HeartbeatConfig, JobHeartbeat};
use crawlq::models::{CrawlBatchPayload, JobKind, JobPayload, JobPriority, SessionStatus};
use crawlq::orchestrator::{CrawlOrchestrator, CrawlRequest, OrchestratorConfig};
use crawlq::progress::TracingProgressSink;
use crawlq::queue::{DistributedCrawlQueue, QueueConfig};
use crawlq::rate_limiter::{DomainLimits, DomainRateLimiter, RateLimitConfig};
use crawlq::starvation::{QueueStarvationProtection, StarvationConfig};
use crawlq::store::{JobStore, MemoryJobStore};
use crawlq::worker_processing::{CrawlWorker, FetchError, FetchedPage, PageFetcher};
use crawlq::worker_scheduler::{ExecutorRegistry, ManagerConfig, ProductionQueueManager};

fn queue(store: Arc<MemoryJobStore>) -> Arc<DistributedCrawlQueue> {
  let config = QueueConfig { max_processing: None, backoff_base: Duration::from_millis(5), ..Default::default() };
  Arc::new(DistributedCrawlQueue::new(store, config))
}

async fn enqueue_generic(queue: &DistributedCrawlQueue, n: usize) -> Vec<Uuid> {
  let mut ids = Vec::with_capacity(n);
  for i in 0..n {
    let payload = JobPayload::Generic { name: format!("job-{}", i), data: serde_json::Value::Null };
    ids.push(queue.enqueue(payload, JobPriority::Normal).await.unwrap());
  }
  ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_job_has_at_most_one_claimant() {
  let store = Arc::new(MemoryJobStore::new());
  let queue = queue(store);
  let id = enqueue_generic(&queue, 1).await[0];

  let claims = join_all((0..20).map(|_| {
    let queue = queue.clone();
    tokio::spawn(async move { queue.claim_job(id).await.unwrap() })
  }))
  .await;
  let winners = claims.into_iter().filter(|c| matches!(c, Ok(Some(_)))).count();
  assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_never_share_a_job() {
  let store = Arc::new(MemoryJobStore::new());
  let queue = queue(store.clone());
  enqueue_generic(&queue, 5).await;

  let results = join_all((0..20).map(|_| {
    let queue = queue.clone();
    tokio::spawn(async move { queue.get_next_job().await.unwrap() })
  }))
  .await;
  let mut claimed: Vec<Uuid> = results.into_iter().filter_map(|r| r.ok().flatten()).map(|j| j.id).collect();
  claimed.sort();
  let before = claimed.len();
  claimed.dedup();
  assert_eq!(before, 5);
  assert_eq!(claimed.len(), 5);
  assert_eq!(queue.status_counts().await.unwrap().processing, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_exceed_the_processing_ceiling() {
  let store = Arc::new(MemoryJobStore::new());
  let config = QueueConfig { max_processing: Some(3), ..Default::default() };
  let queue = Arc::new(DistributedCrawlQueue::new(store.clone(), config));
  enqueue_generic(&queue, 12).await;

  let results = join_all((0..24).map(|_| {
    let queue = queue.clone();
    tokio::spawn(async move { queue.get_next_job().await.unwrap() })
  }))
  .await;
  let claimed = results.into_iter().filter_map(|r| r.ok().flatten()).count();
  assert_eq!(claimed, 3);
  assert_eq!(queue.status_counts().await.unwrap().processing, 3);

  let batches = join_all((0..6).map(|_| {
    let store = store.clone();
    tokio::spawn(async move { store.claim_next_pending(4, Some(5)).await.unwrap().len() })
  }))
  .await;
  let extra: usize = batches.into_iter().map(|r| r.unwrap()).sum();
  assert_eq!(extra, 2);
  assert_eq!(queue.status_counts().await.unwrap().processing, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn domain_leases_respect_the_concurrency_bound() {
  let store = Arc::new(MemoryJobStore::new());
  let config = RateLimitConfig::default()
    .with_override("example.com", DomainLimits { max_concurrent: 3, requests_per_second: 10.0 });
  let limiters: Vec<Arc<DomainRateLimiter>> = (0..4)
    .map(|i| Arc::new(DomainRateLimiter::new(store.clone(), config.clone(), format!("worker-{}", i))))
    .collect();

  let attempts = join_all((0..12).map(|i| {
    let limiter = limiters[i % limiters.len()].clone();
    tokio::spawn(async move { limiter.acquire_domain_lock("Example.com").await.unwrap() })
  }))
  .await;
  let leases: Vec<_> = attempts.into_iter().filter_map(|a| a.ok().flatten()).collect();
  assert_eq!(leases.len(), 3);
  assert_eq!(limiters[0].active_locks("example.com").await.unwrap().len(), 3);

  for lease in leases {
    assert!(lease.release().await.unwrap());
  }
  assert!(limiters[0].active_locks("example.com").await.unwrap().is_empty());
}

/// Counts requests in flight and remembers the peak.
#[derive(Default)]
struct RecordingFetcher {
  in_flight: AtomicUsize,
  peak: AtomicUsize,
  fetched: AtomicUsize,
}

#[async_trait]
impl PageFetcher for RecordingFetcher {
  async fn fetch(&self, _url: &str) -> Result<FetchedPage, FetchError> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    self.fetched.fetch_add(1, Ordering::SeqCst);
    Ok(FetchedPage { status_code: 200, bytes: 512 })
  }
}

fn manager(
  queue: Arc<DistributedCrawlQueue>,
  store: Arc<MemoryJobStore>,
  fetcher: Arc<RecordingFetcher>,
  worker_id: &str,
) -> Arc<ProductionQueueManager> {
  let limits = RateLimitConfig::default()
    .with_override("example.com", DomainLimits { max_concurrent: 1, requests_per_second: 1000.0 });
  let limiter = Arc::new(DomainRateLimiter::new(store, limits, worker_id));
  let worker = CrawlWorker::new(limiter, fetcher, Arc::new(TracingProgressSink), worker_id)
    .with_batch_timeout(Duration::from_secs(5));
  let config = ManagerConfig {
    poll_interval: Duration::from_millis(10),
    max_concurrent: 3,
    job_timeout: Duration::from_secs(10),
    defer_delay: Duration::from_millis(10),
  };
  Arc::new(ProductionQueueManager::new(
    queue.clone(),
    Arc::new(QueueStarvationProtection::new(queue.clone(), StarvationConfig::default())),
    Arc::new(JobHeartbeat::new(queue.clone(), HeartbeatConfig::default())),
    Arc::new(DeadLetterQueue::new(queue, DeadLetterConfig::default())),
    ExecutorRegistry::new().register(JobKind::CrawlBatch, Arc::new(worker)),
    config,
  ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_crawl_one_domain_one_request_at_a_time() {
  let store = Arc::new(MemoryJobStore::new());
  let queue = queue(store.clone());
  let fetcher = Arc::new(RecordingFetcher::default());

  let orchestrator_config = OrchestratorConfig {
    poll_interval: Duration::from_millis(20),
    small_batch: 1,
    default_batch: 1,
    large_batch: 1,
    ..Default::default()
  };
  let orchestrator = Arc::new(CrawlOrchestrator::new(
    queue.clone(),
    Arc::new(StaticDiscoverer::new(Vec::new())),
    Arc::new(TracingProgressSink),
    orchestrator_config,
  ));

  let managers = [
    manager(queue.clone(), store.clone(), fetcher.clone(), "worker-a"),
    manager(queue.clone(), store.clone(), fetcher.clone(), "worker-b"),
  ];
  let loops: Vec<_> = managers.iter().map(|m| m.clone().start()).collect();

  let request = CrawlRequest {
    parent_source_id: Uuid::new_v4(),
    start_url: "https://example.com/".into(),
    urls: Some(vec![
      "https://example.com/a".into(),
      "https://example.com/b".into(),
      "https://example.com/c".into(),
    ]),
    max_pages: None,
    priority: None,
  };
  let session_id = orchestrator.initiate_crawl(request).await.unwrap();

  let session = tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      let session = store.get_session(session_id).await.unwrap().unwrap();
      if session.status.is_terminal() {
        return session;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await
  .expect("session did not finish in time");

  for m in &managers {
    m.shutdown();
  }
  for handle in loops {
    handle.await.unwrap();
  }
  for m in &managers {
    m.drain().await;
  }

  assert_eq!(session.status, SessionStatus::Completed);
  assert_eq!(session.total_batches, 3);
  assert_eq!(session.processed_pages, 3);
  assert_eq!(session.failed_pages, 0);
  assert_eq!(fetcher.fetched.load(Ordering::SeqCst), 3);
  assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);

  let counts = queue.status_counts().await.unwrap();
  assert_eq!(counts.completed, 3);
  assert_eq!(counts.dead_letter, 0);
  assert!(store.active_locks("example.com").await.unwrap().is_empty());
  let completed = managers.iter().map(|m| m.stats().completed).sum::<u64>();
  assert_eq!(completed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_long_batch_keeps_its_domain_lease_until_it_finishes() {
  let store = Arc::new(MemoryJobStore::new());
  let config = RateLimitConfig {
    defaults: DomainLimits { max_concurrent: 1, requests_per_second: 20.0 },
    lease_ttl: Duration::from_millis(100),
    ..Default::default()
  };
  let worker_a = Arc::new(DomainRateLimiter::new(store.clone(), config.clone(), "worker-a"));
  let worker_b = DomainRateLimiter::new(store.clone(), config, "worker-b");
  let fetcher = Arc::new(RecordingFetcher::default());
  let crawler = Arc::new(CrawlWorker::new(worker_a, fetcher.clone(), Arc::new(TracingProgressSink), "worker-a"));

  let batch = CrawlBatchPayload {
    session_id: Uuid::new_v4(),
    parent_source_id: Uuid::new_v4(),
    domain: "example.com".into(),
    urls: (0..6).map(|i| format!("https://example.com/{}", i)).collect(),
    batch_index: 0,
    total_batches: 1,
  };
  let running = tokio::spawn({
    let crawler = crawler.clone();
    async move { crawler.process_batch(Uuid::new_v4(), &batch).await }
  });

  tokio::time::sleep(Duration::from_millis(180)).await;
  assert!(!running.is_finished());
  assert!(worker_b.acquire_domain_lock("example.com").await.unwrap().is_none());

  running.await.unwrap().unwrap();
  assert_eq!(fetcher.fetched.load(Ordering::SeqCst), 6);
  assert!(worker_b.acquire_domain_lock("example.com").await.unwrap().is_some());
}
