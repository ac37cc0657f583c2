//! Fire-and-forget progress notifications.
//!
//! Publishing never blocks the caller and never reports failure back: a sink
//! that cannot deliver logs and drops the event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lapin::Channel;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::messaging::{PROGRESS_QUEUE, create_rabbit_channel, declare_progress_queue, publish_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSubject {
  Session,
  Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
  pub subject: ProgressSubject,
  pub subject_id: Uuid,
  pub status: String,
  pub percent: u8,
  pub message: String,
  pub metadata: serde_json::Value,
  pub at: DateTime<Utc>,
}

impl ProgressEvent {
  pub fn session(id: Uuid, status: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
    Self::new(ProgressSubject::Session, id, status, percent, message)
  }

  pub fn job(id: Uuid, status: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
    Self::new(ProgressSubject::Job, id, status, percent, message)
  }

  fn new(subject: ProgressSubject, id: Uuid, status: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
    Self {
      subject,
      subject_id: id,
      status: status.into(),
      percent: percent.min(100),
      message: message.into(),
      metadata: serde_json::Value::Null,
      at: Utc::now(),
    }
  }

  pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
    self.metadata = metadata;
    self
  }
}

pub trait ProgressSink: Send + Sync {
  fn publish(&self, event: ProgressEvent);
}

pub type SharedProgressSink = Arc<dyn ProgressSink>;

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
  fn publish(&self, event: ProgressEvent) {
    info!(
      subject = ?event.subject,
      id = %event.subject_id,
      status = %event.status,
      percent = event.percent,
      "{}",
      event.message
    );
  }
}

/// Forwards events into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
  tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl ProgressSink for ChannelProgressSink {
  fn publish(&self, event: ProgressEvent) {
    // receiver gone means nobody is watching
    let _ = self.tx.send(event);
  }
}

/// Publishes JSON-encoded events to the RabbitMQ progress queue.
#[derive(Clone)]
pub struct RabbitProgressSink {
  channel: Channel,
  queue: String,
}

impl RabbitProgressSink {
  pub fn new(channel: Channel) -> Self {
    Self { channel, queue: PROGRESS_QUEUE.to_string() }
  }
}

impl ProgressSink for RabbitProgressSink {
  fn publish(&self, event: ProgressEvent) {
    let payload = match serde_json::to_vec(&event) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "failed to encode progress event");
        return;
      }
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!("no runtime available to publish progress event");
      return;
    };
    let channel = self.channel.clone();
    let queue = self.queue.clone();
    handle.spawn(async move {
      if let Err(e) = publish_message(&channel, &queue, &payload).await {
        warn!(error = %e, queue = %queue, "failed to publish progress event");
      }
    });
  }
}

/// Delivers every event to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutProgressSink {
  sinks: Vec<SharedProgressSink>,
}

impl FanoutProgressSink {
  pub fn new(sinks: Vec<SharedProgressSink>) -> Self {
    Self { sinks }
  }
}

impl ProgressSink for FanoutProgressSink {
  fn publish(&self, event: ProgressEvent) {
    for sink in &self.sinks {
      sink.publish(event.clone());
    }
  }
}

/// Log sink always; RabbitMQ as well when a broker URL is configured.
pub async fn build_progress_sink(rabbitmq_url: Option<&str>) -> anyhow::Result<SharedProgressSink> {
  let Some(url) = rabbitmq_url else {
    return Ok(Arc::new(TracingProgressSink));
  };
  let channel = create_rabbit_channel(url).await?;
  declare_progress_queue(&channel).await?;
  Ok(Arc::new(FanoutProgressSink::new(vec![
    Arc::new(TracingProgressSink),
    Arc::new(RabbitProgressSink::new(channel)),
  ])))
}
