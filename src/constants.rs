//! Protocol-wide constants.
//!
//! Magic numbers for addressing, framing and timeouts live here so the
//! transports and the endpoint agree on them.
//!
//! # Categories
//!
//! - **Addressing**: ordinal width and well-known addresses
//! - **Timeouts**: call and accept-loop delays
//! - **Framing**: frame and buffer limits
//! - **Paths**: default socket and config file names

use std::time::Duration;

// ============================================================================
// Addressing
// ============================================================================

/// Default number of zero-padded digits in a generated address ordinal.
pub const DEFAULT_ADDR_DIGITS: usize = 3;

/// Longest ordinal an address may carry. Every 19-digit number fits a `u64`.
pub const MAX_ADDR_DIGITS: usize = 19;

/// Address a hub claims when no hint is configured.
pub const DEFAULT_SERVER_ADDR: &str = "SRV001";

// ============================================================================
// Timeouts
// ============================================================================

/// How long a `call` waits for its reply before failing.
///
/// Applies to networked calls only; local calls resolve as soon as their
/// handlers do.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff after a failed `accept()` on the Unix socket listener.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Framing
// ============================================================================

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Read buffer for socket read loops.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// `sun_path` limit on macOS. Linux allows 108, the smaller one wins.
pub const MAX_SOCKET_PATH: usize = 104;

// ============================================================================
// Paths
// ============================================================================

/// Socket file name inside the config directory.
pub const DEFAULT_SOCKET_NAME: &str = "urnet.sock";

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";
