//! CLI command handlers, one per file.

mod download;
mod purge;
mod refresh;
mod sources;

pub use download::run_download;
pub use purge::run_purge;
pub use refresh::run_refresh;
#[cfg(test)]
pub(crate) use refresh::refresh_with_store;
pub use sources::run_sources;
