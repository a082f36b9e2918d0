//! Tracing subscriber setup.
//!
//! Bridge code logs under `bridge::*` targets (`bridge::port`, `bridge::mux`,
//! `bridge::engine`, `bridge::session`, `bridge::lifecycle` ...), so
//! `RUST_LOG=bridge::session=debug` narrows output to one component.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Installs the global stderr subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Call once, early in `main()`. Panics if a subscriber is already set.
pub fn init_logging() {
    tracing_subscriber::registry().with(stderr_layer()).init();
}

/// Like [`init_logging`], but tolerates an existing subscriber.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(stderr_layer())
        .try_init()
        .is_ok()
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::layer::<S>()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected_quietly() {
        try_init_logging();
        assert!(!try_init_logging());
        tracing::info!(target: "bridge::logging", "still logging");
    }
}
