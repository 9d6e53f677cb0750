mod cli;

use chrono::Duration;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;

use cli::{Args, Command, QueueAction};
use dashcache::cache::{bytes_to_mb, DashboardStore};
use dashcache::clock::Clock;
use dashcache::config::Config;
use dashcache::event::EventBus;
use dashcache::queue::{OfflineQueue, Operation};
use dashcache::sync::{HttpRemote, SyncManager, SyncOptions};

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_dir = if args.no_log_file {
    None
  } else {
    dashcache::logging::default_log_dir()
  };
  if let Some(dir) = &log_dir {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
  }
  let _log_guard = dashcache::logging::init(log_dir.as_deref())?;

  let store = DashboardStore::new(config.store_config()).with_profiles(Arc::new(config.profiles()));
  store.init()?;
  let store = Arc::new(store);
  let events = EventBus::default();
  let queue = Arc::new(OfflineQueue::attach(&store, events.clone())?);

  match args.command {
    Command::Stats => print_stats(&store)?,
    Command::Get { domain, endpoint } => match store.get_entry::<Value>(&domain, &endpoint)? {
      Some(entry) => {
        let max_age = store.profiles().get(&domain).cache_duration();
        let stale = store.is_stale(&domain, &endpoint, max_age)?;
        println!("{}", serde_json::to_string_pretty(&entry.data)?);
        eprintln!(
          "{}",
          cli::last_updated_label(Some(entry.timestamp), store.clock().now(), stale)
        );
      }
      None => return Err(eyre!("No cached entry for {}:{}", domain, endpoint)),
    },
    Command::Put {
      domain,
      endpoint,
      json,
    } => {
      let data: Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let report = store.put(&domain, &endpoint, &data)?;
      if !report.evicted.is_empty() {
        println!("Evicted {} entries from {}", report.evicted.len(), domain);
      }
    }
    Command::Stale {
      domain,
      endpoint,
      max_age,
    } => {
      let max_age = match max_age {
        Some(secs) => Duration::seconds(secs as i64),
        None => store.profiles().get(&domain).cache_duration(),
      };
      let stale = store.is_stale(&domain, &endpoint, max_age)?;
      println!("{}", if stale { "stale" } else { "fresh" });
    }
    Command::Delete { domain, endpoint } => {
      let removed = match endpoint {
        Some(endpoint) => store.delete(&domain, &endpoint)?,
        None => store.delete_by_domain(&domain)?,
      };
      println!("Deleted {} entries", removed);
    }
    Command::Clear => {
      println!("Deleted {} entries", store.clear()?);
    }
    Command::Prune { older_than_secs } => {
      let removed = store.prune_older_than(Duration::seconds(older_than_secs as i64))?;
      println!("Pruned {} entries", removed);
    }
    Command::Queue { action } => run_queue_action(&queue, action)?,
    Command::Sync { domain, force } => {
      let manager = sync_manager(&config, store, queue, events)?;
      let report = manager.sync_dashboard(&domain, SyncOptions { force }).await;
      println!(
        "{}: {} entries ({:?})",
        report.domain,
        report.entries.len(),
        report.source
      );
      if let Some(error) = report.error {
        return Err(eyre!("Sync of {} failed, cached data kept: {}", domain, error));
      }
    }
    Command::Drain => {
      let manager = sync_manager(&config, store, queue, events)?;
      let report = manager.on_reconnect().await;
      println!(
        "Replayed {}, failed {}, refreshed {} domain(s)",
        report.drain.replayed.len(),
        report.drain.failure_count(),
        report.synced.len()
      );
      if let Some(error) = report.error {
        return Err(eyre!("{}", error));
      }
    }
  }

  Ok(())
}

fn sync_manager(
  config: &Config,
  store: Arc<DashboardStore>,
  queue: Arc<OfflineQueue>,
  events: EventBus,
) -> Result<SyncManager> {
  let remote = HttpRemote::new(&config.remote_url()?)?;
  Ok(SyncManager::new(store, queue, Arc::new(remote), events).with_timeout(config.sync_timeout()))
}

fn print_stats(store: &DashboardStore) -> Result<()> {
  let now = store.clock().now();
  let stats = store.stats()?;

  if stats.is_empty() {
    println!("Cache is empty");
  }
  for s in &stats {
    let stale = match s.last_update {
      Some(ts) => now - ts > store.profiles().get(&s.domain).cache_duration(),
      None => true,
    };
    println!(
      "{:<16} {:>6} entries {:>10.2} MB  {}",
      s.domain,
      s.entries,
      bytes_to_mb(s.bytes),
      cli::last_updated_label(s.last_update, now, stale)
    );
  }

  println!(
    "Total ~{:.2} MB of {:.2} MB (estimate){}",
    store.estimate_size_mb()?,
    bytes_to_mb(store.global_max_bytes()),
    if store.is_persistent()? {
      ""
    } else {
      ", in-memory only"
    }
  );
  Ok(())
}

fn run_queue_action(queue: &OfflineQueue, action: QueueAction) -> Result<()> {
  match action {
    QueueAction::List => {
      let items = queue.list()?;
      if items.is_empty() {
        println!("Queue is empty");
      }
      for item in items {
        println!(
          "{:>6}  {:<12} {:<6} {:<32} attempts={}{}",
          item.id,
          item.domain,
          item.operation.method,
          item.operation.target,
          item.attempts,
          item
            .last_error
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
        );
      }
    }
    QueueAction::Add {
      domain,
      method,
      target,
      payload,
    } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let id = queue.enqueue(&domain, Operation::new(method, target, payload))?;
      println!("Queued #{}", id);
    }
    QueueAction::Purge { id } => {
      if !queue.purge(id)? {
        return Err(eyre!("No queued mutation with id {}", id));
      }
    }
    QueueAction::Clear => {
      println!("Discarded {} mutations", queue.clear()?);
    }
  }
  Ok(())
}
