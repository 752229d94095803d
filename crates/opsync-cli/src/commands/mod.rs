pub mod confirm;
mod failed;
mod index;
mod inspect;

pub use failed::{purge_failed, retry_failed};
pub use index::run as rebuild_index;
pub use inspect::run as inspect;
