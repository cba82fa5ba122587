use std::path::PathBuf;
use std::time::Duration;

use crate::types::MAX_MESSAGE_CHARS;

/// Environment variable naming the SQLite database file.
pub const DATABASE_ENV: &str = "SCUTTLEMUTT_DB";

/// Configuration for a [`Scuttlemutt`](crate::Scuttlemutt) instance.
///
/// ```rust
/// use std::time::Duration;
/// use mutt_core::MuttConfig;
///
/// let config = MuttConfig::new()
///     .retry_interval(Duration::from_secs(2))
///     .mesh_relay(false);
/// ```
#[derive(Debug, Clone)]
pub struct MuttConfig {
    /// Longest accepted plaintext, in characters.
    pub max_message_chars: usize,
    /// First delay before retrying pending barks.
    pub retry_interval: Duration,
    /// Backoff ceiling for pending-bark retries.
    pub max_retry_interval: Duration,
    /// Forward barks addressed to others to every other connected endpoint.
    pub mesh_relay: bool,
    /// Sliding window for relay flood protection.
    pub relay_window: Duration,
    /// Most barks one neighbour may hand us for relaying within `relay_window`.
    pub relay_max_barks: usize,
    /// Most copies of one bark one neighbour may send within `relay_window`.
    pub relay_max_repeats: usize,
    /// Send our keys to every newly connected endpoint.
    pub auto_key_exchange: bool,
    /// Text sent by `send_message_or_placeholder` when the real text is too large.
    pub placeholder_text: String,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// SQLite file used by [`open_storage`](crate::storage::open_storage). `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for MuttConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MuttConfig {
    /// Defaults. `SCUTTLEMUTT_DB`, when set, selects the database file.
    pub fn new() -> Self {
        Self {
            max_message_chars: MAX_MESSAGE_CHARS,
            retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(60),
            mesh_relay: true,
            relay_window: Duration::from_secs(1),
            relay_max_barks: 100,
            relay_max_repeats: 3,
            auto_key_exchange: true,
            placeholder_text: "Message too big, message not sent.".to_string(),
            command_buffer: 64,
            event_buffer: 256,
            database_path: std::env::var_os(DATABASE_ENV).map(PathBuf::from),
        }
    }

    pub fn max_message_chars(mut self, chars: usize) -> Self {
        self.max_message_chars = chars;
        self
    }

    /// Set the initial retry delay; the ceiling is raised to match if needed.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self.max_retry_interval = self.max_retry_interval.max(interval);
        self
    }

    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval.max(self.retry_interval);
        self
    }

    pub fn mesh_relay(mut self, enabled: bool) -> Self {
        self.mesh_relay = enabled;
        self
    }

    /// Ban a neighbour that relays more than `max_barks` barks, or repeats
    /// one bark more than `max_repeats` times, within `window`.
    pub fn relay_limits(mut self, window: Duration, max_barks: usize, max_repeats: usize) -> Self {
        self.relay_window = window;
        self.relay_max_barks = max_barks;
        self.relay_max_repeats = max_repeats;
        self
    }

    pub fn auto_key_exchange(mut self, enabled: bool) -> Self {
        self.auto_key_exchange = enabled;
        self
    }

    pub fn placeholder_text(mut self, text: impl Into<String>) -> Self {
        self.placeholder_text = text.into();
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.database_path = None;
        self
    }
}
