//! Tracing setup and rank-aware logging

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used. Calling this
/// twice is harmless, the second install is ignored.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Log `msg` only on rank 0, or on a non-distributed process (rank -1)
pub fn print_rank_0(msg: impl AsRef<str>, rank: i64) {
    if rank <= 0 {
        info!(rank, "{}", msg.as_ref());
    }
}
