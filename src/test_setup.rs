// tracing forwards to `log` when no subscriber is installed, so RUST_LOG=graphsync_rust=debug
// shows manager and queue events in test output
#[cfg(test)]
#[ctor::ctor]
fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
