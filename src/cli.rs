use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dashcache")]
#[command(about = "Inspect and maintain the offline dashboard cache")]
#[command(version)]
pub struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashcache/config.yaml)
  #[arg(short, long)]
  pub config: Option<PathBuf>,

  /// Do not write a log file
  #[arg(long)]
  pub no_log_file: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show entries, size and last update per domain
  Stats,
  /// Print a cached payload
  Get { domain: String, endpoint: String },
  /// Store a JSON payload
  Put {
    domain: String,
    endpoint: String,
    /// Payload as JSON text
    json: String,
  },
  /// Report whether an entry is stale
  Stale {
    domain: String,
    endpoint: String,
    /// Maximum age in seconds (defaults to the domain's cache duration)
    #[arg(long)]
    max_age: Option<u64>,
  },
  /// Delete one entry, or a whole domain when no endpoint is given
  Delete {
    domain: String,
    endpoint: Option<String>,
  },
  /// Delete every cached entry
  Clear,
  /// Delete entries older than the given age in every domain
  Prune {
    #[arg(long)]
    older_than_secs: u64,
  },
  /// Inspect or edit the offline mutation queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Refresh a domain from the remote
  Sync {
    domain: String,
    /// Sync even if the cache is fresh
    #[arg(long)]
    force: bool,
  },
  /// Replay queued mutations, then refresh the domains they touched
  Drain,
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
  /// List pending mutations in replay order
  List,
  /// Queue a mutation
  Add {
    domain: String,
    method: String,
    target: String,
    /// Payload as JSON text
    #[arg(default_value = "null")]
    payload: String,
  },
  /// Remove a single mutation by id
  Purge { id: i64 },
  /// Discard every pending mutation
  Clear,
}

/// Human readable age, e.g. "3m ago".
pub fn format_age(age: Duration) -> String {
  let secs = age.num_seconds().max(0);
  if secs < 60 {
    format!("{}s ago", secs)
  } else if secs < 3600 {
    format!("{}m ago", secs / 60)
  } else if secs < 86_400 {
    format!("{}h ago", secs / 3600)
  } else {
    format!("{}d ago", secs / 86_400)
  }
}

/// "Last updated" label with a stale marker.
pub fn last_updated_label(last: Option<DateTime<Utc>>, now: DateTime<Utc>, stale: bool) -> String {
  match last {
    Some(ts) if stale => format!("Last updated: {} (stale)", format_age(now - ts)),
    Some(ts) => format!("Last updated: {}", format_age(now - ts)),
    None => "Never updated".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_age_units() {
    assert_eq!(format_age(Duration::seconds(42)), "42s ago");
    assert_eq!(format_age(Duration::seconds(180)), "3m ago");
    assert_eq!(format_age(Duration::hours(5)), "5h ago");
    assert_eq!(format_age(Duration::days(2)), "2d ago");
    assert_eq!(format_age(Duration::seconds(-5)), "0s ago");
  }

  #[test]
  fn test_last_updated_label() {
    let now = Utc::now();
    assert_eq!(last_updated_label(None, now, true), "Never updated");
    assert_eq!(
      last_updated_label(Some(now - Duration::minutes(3)), now, true),
      "Last updated: 3m ago (stale)"
    );
  }

  #[test]
  fn test_parses_queue_add() {
    let args = Args::try_parse_from([
      "dashcache", "queue", "add", "grid", "POST", "grid/save", "{\"id\":1}",
    ])
    .unwrap();
    match args.command {
      Command::Queue {
        action: QueueAction::Add { domain, method, .. },
      } => {
        assert_eq!(domain, "grid");
        assert_eq!(method, "POST");
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }

  #[test]
  fn test_delete_endpoint_is_optional() {
    let args = Args::try_parse_from(["dashcache", "delete", "grid"]).unwrap();
    assert!(matches!(
      args.command,
      Command::Delete { endpoint: None, .. }
    ));
  }
}
