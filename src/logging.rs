use log::{debug, log_enabled, Level};

/// Frame dumps are cut after this many bytes.
const MAX_LOG_BYTES: usize = 32;

/// Initializes the logger with the `env_logger` crate.
///
/// `RUST_LOG` takes precedence; without it the relay logs at `info`.
pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

/// Same as [`init_logger`] but safe to call repeatedly, for tests.
pub fn try_init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Log frame data in hex format for debugging.
pub fn log_frame_hex(prefix: &str, peer: &str, data: &[u8]) {
    if !log_enabled!(Level::Debug) {
        return;
    }

    let shown = &data[..data.len().min(MAX_LOG_BYTES)];
    if data.len() > MAX_LOG_BYTES {
        debug!(
            target: "smartport::frame",
            "{prefix} [{peer}] {} ... ({} bytes total)",
            hex::encode(shown),
            data.len()
        );
    } else {
        debug!(target: "smartport::frame", "{prefix} [{peer}] {}", hex::encode(shown));
    }
}
