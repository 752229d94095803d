//! `opsync retry-failed` and `opsync purge-failed` (spec §6.4): both require
//! a short-lived confirmation token, since both act on ops the engine has
//! already given up on — a mistaken re-queue can resend a mutation the user
//! has long since abandoned, and a mistaken purge is unrecoverable.

use super::confirm;
use crate::error::CliError;
use chrono::Utc;
use opsync_kvstore::SledPersistentMap;
use opsync_queue::Queue;
use std::sync::Arc;

pub async fn retry_failed(
    map: Arc<SledPersistentMap>,
    id: Option<String>,
    all: bool,
    confirm_token: Option<String>,
) -> Result<(), CliError> {
    if id.is_some() == all {
        // Both or neither given — the spec's `[--id X | --all]` is exclusive.
        return Err(CliError::Validation(
            "retry-failed requires exactly one of --id <ID> or --all".to_string(),
        ));
    }
    confirm::require("retry-failed", confirm_token.as_deref(), Utc::now())?;

    let queue = Queue::load(map).await?;
    let now = Utc::now();

    let ids: Vec<String> = match id {
        Some(id) => vec![id],
        None => queue.failed_ops().await?.into_iter().map(|op| op.id).collect(),
    };

    let mut retried = 0usize;
    for id in &ids {
        if queue.retry_from_failed(id, now).await? {
            retried += 1;
            println!("retried={id}");
        } else {
            println!("not_found_in_failed={id}");
        }
    }
    println!("retry_failed_count={retried}");
    Ok(())
}

pub async fn purge_failed(map: Arc<SledPersistentMap>, confirm_token: Option<String>) -> Result<(), CliError> {
    confirm::require("purge-failed", confirm_token.as_deref(), Utc::now())?;

    let queue = Queue::load(map).await?;
    let purged = queue.purge_failed().await?;
    println!("purged_count={purged}");
    Ok(())
}
