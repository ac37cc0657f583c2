use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crawlq::config::Config;
use crawlq::database::setup_database;
use crawlq::dead_letter::DeadLetterQueue;
use crawlq::discovery::HttpLinkDiscoverer;
use crawlq::orchestrator::CrawlOrchestrator;
use crawlq::progress::build_progress_sink;
use crawlq::queue::DistributedCrawlQueue;
use crawlq::routes::{ApiState, routes};
use crawlq::starvation::QueueStarvationProtection;
use crawlq::store::PgJobStore;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, config.db_max_connections).await?;
  let store = Arc::new(PgJobStore::new(db_pool));
  let progress = build_progress_sink(config.rabbitmq_url.as_deref()).await?;

  let queue = Arc::new(DistributedCrawlQueue::new(store, config.queue.clone()));
  let orchestrator = Arc::new(CrawlOrchestrator::new(
    queue.clone(),
    Arc::new(HttpLinkDiscoverer::new(DISCOVERY_TIMEOUT)?),
    progress,
    config.orchestrator.clone(),
  ));
  match orchestrator.resume_active_sessions().await {
    Ok(resumed) => info!(resumed, "active sessions resumed"),
    Err(e) => warn!(error = %e, "could not resume active sessions"),
  }

  let state = ApiState {
    orchestrator,
    starvation: Arc::new(QueueStarvationProtection::new(queue.clone(), config.starvation.clone())),
    dead_letter: Arc::new(DeadLetterQueue::new(queue.clone(), config.dead_letter.clone())),
    queue,
  };

  info!(port = config.server_port, "crawl api listening");
  warp::serve(routes(state)).run(([0, 0, 0, 0], config.server_port)).await;
  Ok(())
}
