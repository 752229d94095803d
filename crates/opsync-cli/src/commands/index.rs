//! `opsync rebuild-index` (spec §6.4): "reconstructs `index/*` from `pending/*`".

use crate::error::CliError;
use opsync_kvstore::SledPersistentMap;
use opsync_queue::Queue;
use std::sync::Arc;

pub async fn run(map: Arc<SledPersistentMap>) -> Result<(), CliError> {
    let queue = Queue::load(map).await?;
    let entities = queue.rebuild_index().await?;
    println!("rebuilt_index=true entities_indexed={entities}");
    Ok(())
}
