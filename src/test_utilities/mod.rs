//! Fixtures and helpers shared by unit tests, benches and the demo runtime.
pub mod mocks;
pub mod test_manager;
