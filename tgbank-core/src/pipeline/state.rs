use std::fmt;

/// Where a deposit is in its journey from webhook to notification.
///
/// `Failed` is reachable from `Published` and `Consumed`; the message is
/// redelivered from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepositState {
    Received,
    Published,
    Consumed,
    Applied,
    Notified,
    Failed,
}

impl DepositState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositState::Received => "received",
            DepositState::Published => "published",
            DepositState::Consumed => "consumed",
            DepositState::Applied => "applied",
            DepositState::Notified => "notified",
            DepositState::Failed => "failed",
        }
    }
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
