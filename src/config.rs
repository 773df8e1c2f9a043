use tracing::{event, Level};

use crate::error::{GraphsyncError, Result};

include!(concat!(env!("OUT_DIR"), "/constants.rs"));

/// Results buffered per request before a slow consumer suspends the traversal.
pub const DEFAULT_RESULT_BUFFER: usize = 16;
/// Protocol violations tolerated from one peer before it is torn down.
pub const DEFAULT_MAX_PROTOCOL_ERRORS: u32 = 8;
/// Space reserved in every frame for the envelope and the response records.
pub const MESSAGE_OVERHEAD: usize = 256;

/// Tunables of a graphsync instance.
///
/// Defaults are baked in at build time (see `build.rs`). A settings file can
/// override any of them under the `graphsync` table:
///
/// ```toml
/// [graphsync]
/// max_message_size = 1048576
/// result_buffer = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSyncConfig {
    /// Upper bound on the encoded size of one wire message.
    pub max_message_size: usize,
    /// Block bytes a peer's queue holds before responder traversals suspend.
    pub max_pending_block_bytes: usize,
    pub result_buffer: usize,
    pub max_protocol_errors: u32,
    /// Largest frame a decoder accepts.
    pub max_decode_size: u64,
}

impl Default for GraphSyncConfig {
    fn default() -> Self {
        GraphSyncConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_block_bytes: DEFAULT_MAX_PENDING_BLOCK_BYTES,
            result_buffer: DEFAULT_RESULT_BUFFER,
            max_protocol_errors: DEFAULT_MAX_PROTOCOL_ERRORS,
            max_decode_size: (DEFAULT_MAX_MESSAGE_SIZE * 2) as u64,
        }
    }
}

impl GraphSyncConfig {
    /// Reads `graphsync.*` keys from the named settings file over the defaults.
    /// A missing file yields the defaults.
    pub fn load(config_name: &str) -> Result<Self> {
        let mut settings = config::Config::default();
        settings.merge(config::File::with_name(config_name).required(false))?;
        GraphSyncConfig::from_settings(&settings)
    }

    pub fn from_settings(settings: &config::Config) -> Result<Self> {
        let mut graphsync_config = GraphSyncConfig::default();
        if let Ok(value) = settings.get::<usize>("graphsync.max_message_size") {
            graphsync_config.max_message_size = value;
        }
        if let Ok(value) = settings.get::<usize>("graphsync.max_pending_block_bytes") {
            graphsync_config.max_pending_block_bytes = value;
        }
        if let Ok(value) = settings.get::<usize>("graphsync.result_buffer") {
            graphsync_config.result_buffer = value;
        }
        if let Ok(value) = settings.get::<u32>("graphsync.max_protocol_errors") {
            graphsync_config.max_protocol_errors = value;
        }
        match settings.get::<u64>("graphsync.max_decode_size") {
            Ok(value) => graphsync_config.max_decode_size = value,
            Err(_) => {
                graphsync_config.max_decode_size =
                    graphsync_config.max_decode_size.max(graphsync_config.max_message_size as u64 * 2)
            }
        }
        graphsync_config.validate()?;
        event!(Level::DEBUG, "graphsync config {:?}", graphsync_config);
        Ok(graphsync_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size <= 2 * MESSAGE_OVERHEAD {
            return Err(GraphsyncError::Config(format!(
                "max_message_size must exceed {} bytes",
                2 * MESSAGE_OVERHEAD
            )));
        }
        if self.result_buffer == 0 {
            return Err(GraphsyncError::Config(String::from(
                "result_buffer must be positive",
            )));
        }
        if self.max_decode_size < self.max_message_size as u64 {
            return Err(GraphsyncError::Config(String::from(
                "max_decode_size must be at least max_message_size",
            )));
        }
        Ok(())
    }

    /// Room for queued items in a single message.
    pub fn block_budget(&self) -> usize {
        self.max_message_size - MESSAGE_OVERHEAD
    }

    /// Largest block a responder will send. Bigger blocks are reported as
    /// not present so the message bound always holds.
    pub fn max_block_size(&self) -> usize {
        self.max_message_size.saturating_sub(2 * MESSAGE_OVERHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let graphsync_config = GraphSyncConfig::default();
        assert!(graphsync_config.validate().is_ok());
        assert_eq!(graphsync_config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(graphsync_config.block_budget() < graphsync_config.max_message_size);
    }

    #[test]
    fn settings_override_defaults() {
        let mut settings = config::Config::default();
        settings.set("graphsync.max_message_size", 65536).unwrap();
        settings.set("graphsync.result_buffer", 4).unwrap();
        let graphsync_config = GraphSyncConfig::from_settings(&settings).unwrap();
        assert_eq!(graphsync_config.max_message_size, 65536);
        assert_eq!(graphsync_config.result_buffer, 4);
        assert_eq!(
            graphsync_config.max_pending_block_bytes,
            DEFAULT_MAX_PENDING_BLOCK_BYTES
        );

        settings.set("graphsync.result_buffer", 0).unwrap();
        assert!(GraphSyncConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let graphsync_config = GraphSyncConfig::load("no-such-graphsync-config").unwrap();
        assert_eq!(graphsync_config, GraphSyncConfig::default());
    }
}
