//! Logger setup.
//!
//! The engine logs through the `log` facade. Applications may install any
//! logger; these helpers install `env_logger`.

/// Install `env_logger` with an `info` default, overridable through `RUST_LOG`.
///
/// Panics if a logger is already installed, like `env_logger::init`.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Install a test logger at `debug` level. Safe to call from every test.
pub fn init_for_tests() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
