use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use resync_core::domain::{DeliveryError, SyncEvent};
use resync_core::impls::{FileStorage, InMemoryDocumentStore};
use resync_core::{CoordinatorBuilder, SyncConfig};

/// オフラインで投入 → オンライン復帰で drain、の一巡を見せるデモ
#[derive(Debug, Parser)]
#[command(name = "resync-cli", version)]
struct Args {
    /// JSON config file (defaults are used when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the offline queue persists into
    #[arg(long, default_value = ".resync")]
    queue_dir: PathBuf,

    /// Number of chat messages to submit while offline
    #[arg(long, default_value_t = 5)]
    actions: usize,

    /// Inject this many transient write failures before the backend recovers
    #[arg(long, default_value_t = 0)]
    fail_first: usize,

    /// Give up waiting for the drain after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::from_path(path)?,
        None => SyncConfig::default(),
    };

    // (A) backend と永続ストレージを用意
    let store = InMemoryDocumentStore::new();
    for n in 1..=args.fail_first {
        store.fail_next(DeliveryError::Transient(format!("injected failure {n}")));
    }
    let storage = FileStorage::open(&args.queue_dir).await?;

    let coordinator = CoordinatorBuilder::new()
        .config(config)
        .document_store(store.clone())
        .storage(storage)
        .build()
        .await?;
    if coordinator.queue_depth() > 0 {
        println!("restored {} queued action(s)", coordinator.queue_depth());
    }

    // (B) 結果を表示する observer
    let mut events = coordinator.events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Delivered { action_id, ack }) => {
                    println!("delivered {action_id} at ts={}", ack.server_timestamp);
                }
                Ok(SyncEvent::Dropped { action_id, reason }) => {
                    println!("dropped   {action_id}: {reason}");
                }
                Ok(SyncEvent::Confirmed { action_id, .. }) => {
                    println!("confirmed {action_id}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    coordinator.open_view("chat")?;

    // (C) offline のまま投入
    for n in 1..=args.actions {
        let id = coordinator
            .submit("chat", json!({ "text": format!("message {n}") }))
            .await?;
        println!("submitted {id}");
    }
    println!("queue depth while offline: {}", coordinator.queue_depth());

    // (D) online に戻して drain を待つ
    info!("going online");
    coordinator.connectivity().set_online();

    let deadline = Duration::from_secs(args.timeout_secs);
    let drained = tokio::time::timeout(deadline, async {
        while coordinator.queue_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = coordinator.queue_depth(),
            "queue did not drain in time; entries stay persisted"
        );
    }
    // echo が届くのを少し待つ
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = coordinator.status().await;
    println!("writes accepted: {}", store.write_count());
    println!("{}", serde_json::to_string_pretty(&status)?);

    coordinator.shutdown().await;
    printer.abort();
    Ok(())
}
