//! Outbound notifications: channel parsing, the enable gate, and the throttle
//! that caps repeats to one per window.

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::host::Notifier;

/// The only category notifications may be sent through.
pub const NOTIFY_CATEGORY: &str = "notify";

/// A validated `notify.<name>` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyChannel {
    pub name: String,
}

impl NotifyChannel {
    /// Parse `"notify.<name>"`. Anything else (wrong category, missing or
    /// empty name, no dot) is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (category, name) = raw.trim().split_once('.')?;
        if category != NOTIFY_CATEGORY || name.trim().is_empty() {
            return None;
        }
        Some(Self {
            name: name.trim().to_string(),
        })
    }
}

/// Send a notification if `enabled` and `channel` is well formed.
/// Returns whether a message was handed to the notifier.
pub fn notify(
    notifier: &dyn Notifier,
    channel: Option<&str>,
    enabled: bool,
    title: &str,
    message: &str,
) -> bool {
    if !enabled {
        return false;
    }
    let Some(channel) = channel.and_then(NotifyChannel::parse) else {
        debug!(?channel, "notification enabled but no usable channel configured");
        return false;
    };
    notifier.send(NOTIFY_CATEGORY, &channel.name, title, message);
    true
}

/// True iff a previous send exists and happened less than `window_min` ago.
pub fn should_throttle(last_notify: Option<OffsetDateTime>, window_min: i64, now: OffsetDateTime) -> bool {
    match last_notify {
        None => false,
        Some(last) => now - last < Duration::minutes(window_min),
    }
}
