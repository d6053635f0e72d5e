use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use num_enum::TryFromPrimitive;

use crate::tracker::Tracker;

/// Reset requests a device's user-action button can trigger. The numeric
///  values are the wire codes of the user-action packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResetKind {
    Full = 2,
    Yaw = 3,
    Mounting = 4,
}

impl Display for ResetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetKind::Full => write!(f, "full"),
            ResetKind::Yaw => write!(f, "yaw"),
            ResetKind::Mounting => write!(f, "mounting"),
        }
    }
}

/// The enclosing application, as the server sees it. Taking this as an
///  explicit dependency instead of binding to a process-wide singleton keeps
///  the server deterministic under test.
#[cfg_attr(test, automock)]
pub trait TrackerHost: Send + Sync + 'static {
    /// Allocates the next application-wide tracker id.
    fn next_tracker_id(&self) -> u32;

    /// Called exactly once for every newly provisioned tracker.
    fn tracker_added(&self, tracker: Arc<Tracker>);

    /// Device console output, one line at a time, already prefixed with the
    ///  device name.
    fn console_line(&self, line: &str);

    fn reset_started(&self, kind: ResetKind);

    fn reset_full(&self, source: &str);

    fn reset_yaw(&self, source: &str);

    fn reset_mounting(&self, source: &str);
}
