//! Development-time tracing for debugging fleet commands.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics on stderr, filtered by
//!   `RUST_LOG` or the `-v` flag. Not persisted, not part of fleet product output.
//!
//! - **Job artifacts (`io/job_store`)**: Product artifacts under
//!   `<home>/jobs/<id>/`. Always written, unaffected by tracing filters.
//!
//! - **Command output (`main`)**: `key=value` lines or `--json` on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: `warn`, `-v` for fleet `info`,
/// `-vv` for fleet `debug`.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,fleet=info",
        _ => "warn,fleet=debug",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `verbose` when set. Output: stderr, compact format
/// with timestamps, since `watchdog` runs long enough for them to matter.
///
/// # Example
/// ```bash
/// RUST_LOG=fleet::sweep=debug fleet sweep --dry-run
/// fleet -vv watchdog --job J1
/// ```
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // A second init (e.g. in-process tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 1)
                .compact(),
        )
        .try_init();
}
