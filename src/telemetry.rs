//! Tracing initialization for embedders and the `demos/` binaries.
//!
//! Structured logging itself is treated as an external collaborator per
//! §1 ("logging" is named as out of scope for re-implementation), but a
//! complete crate still needs a one-line way to wire it up the way the
//! rest of the pack does — `tracing_subscriber::fmt` with an `EnvFilter`
//! defaulting to this crate's own target.

use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber::fmt` subscriber with an `EnvFilter`
/// defaulting to `info` for this crate and `warn` elsewhere, honoring
/// `RUST_LOG` when set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,sse_duplex=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
