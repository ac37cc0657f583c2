use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crawlq::config::Config;
use crawlq::database::setup_database;
use crawlq::dead_letter::DeadLetterQueue;
use crawlq::heartbeat::JobHeartbeat;
use crawlq::models::JobKind;
use crawlq::progress::build_progress_sink;
use crawlq::queue::DistributedCrawlQueue;
use crawlq::rate_limiter::DomainRateLimiter;
use crawlq::recovery::AutomaticQueueRecovery;
use crawlq::starvation::QueueStarvationProtection;
use crawlq::store::PgJobStore;
use crawlq::worker_processing::{CrawlWorker, HttpPageFetcher};
use crawlq::worker_scheduler::{ExecutorRegistry, ProductionQueueManager};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  info!(worker_id = %config.worker_id, "starting crawl worker");

  let db_pool = setup_database(&config.database_url, config.db_max_connections).await?;
  let store = Arc::new(PgJobStore::new(db_pool));
  let progress = build_progress_sink(config.rabbitmq_url.as_deref()).await?;

  let queue = Arc::new(DistributedCrawlQueue::new(store.clone(), config.queue.clone()));
  let limiter = Arc::new(DomainRateLimiter::new(store, config.rate_limit.clone(), config.worker_id.clone()));
  let heartbeat = Arc::new(JobHeartbeat::new(queue.clone(), config.heartbeat.clone()));
  let dead_letter = Arc::new(DeadLetterQueue::new(queue.clone(), config.dead_letter.clone()));
  let starvation = Arc::new(QueueStarvationProtection::new(queue.clone(), config.starvation.clone()));
  let recovery = Arc::new(AutomaticQueueRecovery::new(
    queue.clone(),
    limiter.clone(),
    heartbeat.clone(),
    dead_letter.clone(),
    config.recovery.clone(),
  ));

  let fetcher = Arc::new(HttpPageFetcher::new(FETCH_TIMEOUT)?);
  let crawl_worker = CrawlWorker::new(limiter, fetcher, progress, config.worker_id.clone())
    .with_batch_timeout(config.batch_timeout);
  let executors = ExecutorRegistry::new().register(JobKind::CrawlBatch, Arc::new(crawl_worker));

  let manager = Arc::new(ProductionQueueManager::new(
    queue,
    starvation,
    heartbeat.clone(),
    dead_letter,
    executors,
    config.manager.clone(),
  ));

  let heartbeat_task = heartbeat.clone().start();
  let recovery_task = recovery.clone().start();

  manager.run_until_shutdown().await;

  heartbeat.shutdown();
  recovery.shutdown();
  // both loops sleep a full interval between passes
  heartbeat_task.abort();
  recovery_task.abort();
  info!("crawl worker stopped");
  Ok(())
}
