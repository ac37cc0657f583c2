//! Terminal dashboard for operators.
//!
//! Overview (status counts and per-band backlog)
//! Queue (next pending jobs in dispatch order)
//! Dead Letters (failure stats and latest entries)
//! Progress (live events from the progress queue, when RabbitMQ is configured)

use std::{
  collections::VecDeque,
  io,
  sync::{Arc, mpsc},
  thread,
  time::{Duration, Instant},
};

use anyhow::Result;
use chrono::Utc;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures_lite::StreamExt;
use lapin::{
  Channel,
  options::{BasicAckOptions, BasicConsumeOptions},
  types::FieldTable,
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

use crawlq::config::Config;
use crawlq::database::setup_database;
use crawlq::dead_letter::{DeadLetterQueue, DeadLetterStats};
use crawlq::messaging::{PROGRESS_QUEUE, create_rabbit_channel, declare_progress_queue};
use crawlq::models::{Job, JobFilter, JobStatus};
use crawlq::progress::ProgressEvent;
use crawlq::queue::{DistributedCrawlQueue, StatusCounts};
use crawlq::starvation::{BandStats, QueueStarvationProtection};
use crawlq::store::PgJobStore;

const QUEUE_PREVIEW: i64 = 10;
const DEAD_LETTER_PREVIEW: i64 = 10;
const PROGRESS_HISTORY: usize = 50;
const REFRESH: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Snapshot {
  counts: StatusCounts,
  bands: Vec<BandStats>,
  next_jobs: Vec<Job>,
  dead_letters: Vec<Job>,
  dead_letter_stats: DeadLetterStats,
}

enum Update {
  Snapshot(Snapshot),
  Progress(ProgressEvent),
  Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DashboardTab {
  Overview,
  Queue,
  DeadLetters,
  Progress,
}

impl DashboardTab {
  const ALL: [DashboardTab; 4] = [
    DashboardTab::Overview,
    DashboardTab::Queue,
    DashboardTab::DeadLetters,
    DashboardTab::Progress,
  ];

  fn index(self) -> usize {
    Self::ALL.iter().position(|t| *t == self).unwrap_or(0)
  }

  fn title(self) -> &'static str {
    match self {
      DashboardTab::Overview => "Overview",
      DashboardTab::Queue => "Queue",
      DashboardTab::DeadLetters => "Dead Letters",
      DashboardTab::Progress => "Progress",
    }
  }
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
  progress: VecDeque<ProgressEvent>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      snapshot: Snapshot::default(),
      progress: VecDeque::with_capacity(PROGRESS_HISTORY),
      last_error: None,
    }
  }

  fn next_tab(&mut self) {
    let i = (self.current_tab.index() + 1) % DashboardTab::ALL.len();
    self.current_tab = DashboardTab::ALL[i];
  }

  fn previous_tab(&mut self) {
    let len = DashboardTab::ALL.len();
    let i = (self.current_tab.index() + len - 1) % len;
    self.current_tab = DashboardTab::ALL[i];
  }

  fn apply(&mut self, update: Update) {
    match update {
      Update::Snapshot(snapshot) => {
        self.snapshot = snapshot;
        self.last_error = None;
      }
      Update::Progress(event) => {
        if self.progress.len() == PROGRESS_HISTORY {
          self.progress.pop_back();
        }
        self.progress.push_front(event);
      }
      Update::Error(message) => self.last_error = Some(message),
    }
  }
}

struct Sources {
  queue: Arc<DistributedCrawlQueue>,
  starvation: QueueStarvationProtection,
  dead_letter: DeadLetterQueue,
}

impl Sources {
  async fn connect(config: &Config) -> Result<Self> {
    let pool = setup_database(&config.database_url, 2).await?;
    let queue = Arc::new(DistributedCrawlQueue::new(Arc::new(PgJobStore::new(pool)), config.queue.clone()));
    Ok(Self {
      starvation: QueueStarvationProtection::new(queue.clone(), config.starvation.clone()),
      dead_letter: DeadLetterQueue::new(queue.clone(), config.dead_letter.clone()),
      queue,
    })
  }

  async fn snapshot(&self) -> Result<Snapshot> {
    let next_jobs = self
      .queue
      .store()
      .query_jobs(&JobFilter::status(JobStatus::Pending).limit(QUEUE_PREVIEW))
      .await?;
    Ok(Snapshot {
      counts: self.queue.status_counts().await?,
      bands: self.starvation.band_statistics().await?,
      next_jobs,
      dead_letters: self.dead_letter.list(DEAD_LETTER_PREVIEW).await?,
      dead_letter_stats: self.dead_letter.statistics().await?,
    })
  }
}

async fn consume_progress(channel: Channel, tx: mpsc::Sender<Update>) -> Result<()> {
  declare_progress_queue(&channel).await?;
  let mut consumer = channel
    .basic_consume(PROGRESS_QUEUE, "crawlq_dashboard", BasicConsumeOptions::default(), FieldTable::default())
    .await?;
  while let Some(delivery) = consumer.next().await {
    let delivery = delivery?;
    let update = match serde_json::from_slice::<ProgressEvent>(&delivery.data) {
      Ok(event) => Update::Progress(event),
      Err(e) => Update::Error(format!("undecodable progress event: {}", e)),
    };
    delivery.ack(BasicAckOptions::default()).await?;
    if tx.send(update).is_err() {
      break;
    }
  }
  Ok(())
}

fn spawn_background(config: Config, tx: mpsc::Sender<Update>) {
  thread::spawn(move || {
    let rt = match Runtime::new() {
      Ok(rt) => rt,
      Err(e) => {
        let _ = tx.send(Update::Error(format!("runtime: {}", e)));
        return;
      }
    };
    rt.block_on(async move {
      let sources = match Sources::connect(&config).await {
        Ok(sources) => sources,
        Err(e) => {
          let _ = tx.send(Update::Error(format!("database: {}", e)));
          return;
        }
      };

      if let Some(url) = config.rabbitmq_url.clone() {
        let progress_tx = tx.clone();
        tokio::spawn(async move {
          let result = match create_rabbit_channel(&url).await {
            Ok(channel) => consume_progress(channel, progress_tx.clone()).await,
            Err(e) => Err(e),
          };
          if let Err(e) = result {
            let _ = progress_tx.send(Update::Error(format!("progress feed: {}", e)));
          }
        });
      }

      loop {
        let update = match sources.snapshot().await {
          Ok(snapshot) => Update::Snapshot(snapshot),
          Err(e) => Update::Error(e.to_string()),
        };
        if tx.send(update).is_err() {
          break;
        }
        tokio::time::sleep(REFRESH).await;
      }
    });
  });
}

fn main() -> Result<()> {
  let config = Config::from_env()?;

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = mpsc::channel::<Update>();
  spawn_background(config, tx);

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    while let Ok(update) = rx.try_recv() {
      app.apply(update);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right | KeyCode::Tab => app.next_tab(),
          KeyCode::Left | KeyCode::BackTab => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tabs = Tabs::new(
    DashboardTab::ALL
      .iter()
      .map(|t| Spans::from(Span::styled(t.title(), Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("crawlq"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(app.current_tab.index());
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::DeadLetters => render_dead_letters(f, app, chunks[1]),
    DashboardTab::Progress => render_progress(f, app, chunks[1]),
  }

  let footer = match &app.last_error {
    Some(e) => Paragraph::new(format!("error: {}", e)).style(Style::default().fg(Color::Red)),
    None => Paragraph::new("←/→: Switch Tabs | q: Quit").style(Style::default().fg(Color::White)),
  };
  f.render_widget(footer.block(Block::default().borders(Borders::ALL)), chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
    .split(area);

  let counts = &app.snapshot.counts;
  let count_items: Vec<ListItem> = [
    ("pending", counts.pending, Color::Yellow),
    ("processing", counts.processing, Color::Cyan),
    ("completed", counts.completed, Color::Green),
    ("failed", counts.failed, Color::Magenta),
    ("dead_letter", counts.dead_letter, Color::Red),
  ]
  .into_iter()
  .map(|(label, n, color)| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:<12}", label), Style::default().fg(color)),
      Span::raw(n.to_string()),
    ]))
  })
  .collect();
  f.render_widget(
    List::new(count_items).block(Block::default().borders(Borders::ALL).title("Jobs by Status")),
    chunks[0],
  );

  let band_items: Vec<ListItem> = app
    .snapshot
    .bands
    .iter()
    .map(|b| {
      let oldest = b.oldest_job.map(|t| t.format("%H:%M:%S").to_string()).unwrap_or_else(|| "-".into());
      ListItem::new(Spans::from(Span::raw(format!(
        "{:<8} pending {:>5} | avg wait {:>8.1}s | oldest {}",
        b.band.as_str(),
        b.count,
        b.average_wait_secs,
        oldest
      ))))
    })
    .collect();
  f.render_widget(
    List::new(band_items).block(Block::default().borders(Borders::ALL).title("Priority Bands")),
    chunks[1],
  );
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let now = Utc::now();
  let items: Vec<ListItem> = app
    .snapshot
    .next_jobs
    .iter()
    .map(|job| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", job.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
          "{} | {} ({}) | waiting {}s | attempts {}/{}",
          job.kind(),
          job.band().as_str(),
          job.priority,
          job.wait_time(now).num_seconds(),
          job.attempts,
          job.max_attempts,
        )),
      ]))
    })
    .collect();
  let title = format!("Next {} Pending Jobs ({} pending)", QUEUE_PREVIEW, app.snapshot.counts.pending);
  f.render_widget(List::new(items).block(Block::default().borders(Borders::ALL).title(title)), area);
}

fn render_dead_letters<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([Constraint::Length(4), Constraint::Min(0)].as_ref())
    .split(area);

  let stats = &app.snapshot.dead_letter_stats;
  let by_type = stats
    .by_type
    .iter()
    .map(|(kind, n)| format!("{}={}", kind, n))
    .collect::<Vec<_>>()
    .join(" ");
  let summary = Paragraph::new(vec![
    Spans::from(Span::raw(format!(
      "total {} | last 24h {} | failures last hour {}",
      stats.total, stats.last_24h, stats.failures_last_hour
    ))),
    Spans::from(Span::raw(format!("by type: {}", if by_type.is_empty() { "-".into() } else { by_type }))),
  ])
  .block(Block::default().borders(Borders::ALL).title("Dead Letter Stats"));
  f.render_widget(summary, chunks[0]);

  let items: Vec<ListItem> = app
    .snapshot
    .dead_letters
    .iter()
    .map(|job| {
      ListItem::new(Spans::from(vec![
        Span::styled(job.updated_at.format("%m-%d %H:%M ").to_string(), Style::default().fg(Color::Red)),
        Span::raw(format!("{} {} ", job.id, job.kind())),
        Span::raw(job.error_message.clone().unwrap_or_default()),
      ]))
    })
    .collect();
  f.render_widget(
    List::new(items).block(Block::default().borders(Borders::ALL).title("Latest Dead Letters")),
    chunks[1],
  );
}

fn render_progress<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .progress
    .iter()
    .map(|e| {
      ListItem::new(Spans::from(vec![
        Span::styled(e.at.format("%H:%M:%S").to_string(), Style::default().fg(Color::Green)),
        Span::raw(format!(" {:?} {} {:>3}% {} - {}", e.subject, e.subject_id, e.percent, e.status, e.message)),
      ]))
    })
    .collect();
  f.render_widget(
    List::new(items).block(Block::default().borders(Borders::ALL).title("Progress Events")),
    area,
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use uuid::Uuid;

  #[test]
  fn tabs_wrap_in_both_directions() {
    let mut app = App::new();
    app.previous_tab();
    assert_eq!(app.current_tab, DashboardTab::Progress);
    app.next_tab();
    assert_eq!(app.current_tab, DashboardTab::Overview);
  }

  #[test]
  fn progress_history_is_bounded_newest_first() {
    let mut app = App::new();
    for i in 0..(PROGRESS_HISTORY + 5) {
      app.apply(Update::Progress(ProgressEvent::job(Uuid::new_v4(), "processing", 0, format!("event {}", i))));
    }
    assert_eq!(app.progress.len(), PROGRESS_HISTORY);
    assert_eq!(app.progress[0].message, format!("event {}", PROGRESS_HISTORY + 4));
  }

  #[test]
  fn snapshot_clears_the_last_error() {
    let mut app = App::new();
    app.apply(Update::Error("db down".into()));
    assert!(app.last_error.is_some());
    app.apply(Update::Snapshot(Snapshot::default()));
    assert!(app.last_error.is_none());
  }
}
