//! Protocol and scheduling constants for mixnotify.
//!
//! Centralizes the magic numbers shared by registration, the epoch manager
//! and the dispatch loop. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Registration**: Freshness window and signature domain tags
//! - **Scheduling**: Default intervals for the background tasks
//! - **Epochs**: Default window width and address-space size
//! - **Notifications**: Fixed notification payload
//! - **FCM auth**: OAuth service-account token exchange

use std::time::Duration;

// ============================================================================
// Registration
// ============================================================================

/// Maximum age of a signed client request.
///
/// Requests whose timestamp is older than this are rejected as replays.
pub const REQUEST_FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

/// Domain tag appended to register-token signatures.
pub const REGISTER_TOKEN_TAG: &str = "register-token";

/// Domain tag appended to unregister-token signatures.
pub const UNREGISTER_TOKEN_TAG: &str = "unregister-token";

/// Domain tag appended to register-tracked-id signatures.
pub const REGISTER_TRACKED_ID_TAG: &str = "register-tracked-id";

/// Domain tag appended to unregister-tracked-id signatures.
pub const UNREGISTER_TRACKED_ID_TAG: &str = "unregister-tracked-id";

/// Authority id used when the config does not name one.
pub const DEFAULT_AUTHORITY_ID: &str = "permissioning";

// ============================================================================
// Scheduling
// ============================================================================

/// Delay between two dispatch iterations.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for a single gateway poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a single push provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the epoch creator pass.
pub const DEFAULT_CREATOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval of the epoch deleter pass.
pub const DEFAULT_DELETER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between state snapshot writes.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between network definition refreshes from the gateway.
pub const DEFAULT_NDF_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Epochs
// ============================================================================

/// Width of one epoch window.
pub const DEFAULT_EPOCH_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of significant bits of an ephemeral id.
pub const DEFAULT_ADDRESS_SPACE_SIZE: u8 = 16;

/// Largest address-space size an ephemeral id can carry.
pub const MAX_ADDRESS_SPACE_SIZE: u8 = 64;

/// Widest epoch window accepted from config or the network.
pub const MAX_EPOCH_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ============================================================================
// Notifications
// ============================================================================

/// Title of the fixed notification.
pub const NOTIFICATION_TITLE: &str = "New message";

/// Body of the fixed notification.
pub const NOTIFICATION_BODY: &str = "You have a new message waiting";

/// Time-to-live handed to web push services, in seconds.
pub const WEB_PUSH_TTL_SECS: u32 = 86_400;

// ============================================================================
// FCM auth
// ============================================================================

/// OAuth scope for FCM HTTP v1 sends.
pub const FCM_OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Token endpoint used when a service account file does not name one.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime requested for the signed service-account assertion.
pub const OAUTH_ASSERTION_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Access tokens are refreshed this long before they expire.
pub const ACCESS_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
