/*!
 * Logging initialization
 */

use env_logger::Env;

/// Initialize logging for the binary. `RUST_LOG` wins over the debug flag.
pub fn init(debug: bool) {
    let default_filter = if debug { "irodsfs=debug" } else { "irodsfs=info" };

    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

/// Initialize logging once for tests; safe to call from every test.
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("irodsfs=debug"))
            .is_test(true)
            .try_init()
            .ok();
    });
}
