//! `opsync inspect` (spec §6.4): "dumps queue depth, oldest op age, breaker
//! state, lock holder."

use crate::error::CliError;
use chrono::Utc;
use opsync_kvstore::SledPersistentMap;
use opsync_lock::ProcessingLock;
use opsync_queue::Queue;
use std::sync::Arc;

pub async fn run(map: Arc<SledPersistentMap>) -> Result<(), CliError> {
    let queue = Queue::load(map.clone()).await?;
    let lock = ProcessingLock::new(map);
    let now = Utc::now();

    let depth = queue.size().await?;
    let failed_depth = queue.failed_size().await?;
    let oldest = queue.pending_ops().await?.into_iter().next();

    println!("queue_depth={depth}");
    println!("failed_depth={failed_depth}");
    match oldest {
        Some(op) => {
            let age = now.signed_duration_since(op.created_at);
            println!("oldest_op_id={}", op.id);
            println!("oldest_op_age_secs={}", age.num_seconds().max(0));
        }
        None => println!("oldest_op_age_secs=0"),
    }

    // Circuit breaker state is explicitly in-memory only (spec §3.5: "In-
    // memory; not persisted"), so a separate CLI invocation can never read
    // the live engine process's breaker mode — only the engine process
    // itself can report it, over its own `onStatusChange`/metrics streams.
    println!("breaker_mode=unknown (in-memory only, not persisted; inspect the running process's metrics stream instead)");

    match lock.current().await? {
        Some(record) => {
            let stale = now.signed_duration_since(record.last_heartbeat_at).num_seconds() > record.ttl_secs;
            println!("lock_holder={}", record.holder_id);
            println!("lock_acquired_at={}", record.acquired_at.to_rfc3339());
            println!("lock_last_heartbeat_at={}", record.last_heartbeat_at.to_rfc3339());
            println!("lock_stale={stale}");
        }
        None => println!("lock_holder=none"),
    }

    Ok(())
}
