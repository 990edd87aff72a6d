// Named registries, one per change feed.
use std::fmt;
use std::str::FromStr;

use crate::registry::SubscriptionRegistry;
use crate::PollError;

/// The change feeds the platform publishes: new notifications from a
/// device, new commands for a device, and updates to an issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Notifications,
    Commands,
    CommandUpdates,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Notifications => "notification",
            Feed::Commands => "command",
            Feed::CommandUpdates => "command_update",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feed {
    type Err = PollError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "notification" => Ok(Feed::Notifications),
            "command" => Ok(Feed::Commands),
            "command_update" => Ok(Feed::CommandUpdates),
            other => Err(PollError::UnknownFeed(other.to_string())),
        }
    }
}

/// One registry per feed, so notification waiters are never woken by
/// command traffic and vice versa.
#[derive(Default)]
pub struct SubscriptionHub {
    notifications: SubscriptionRegistry,
    commands: SubscriptionRegistry,
    command_updates: SubscriptionRegistry,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self, feed: Feed) -> &SubscriptionRegistry {
        match feed {
            Feed::Notifications => &self.notifications,
            Feed::Commands => &self.commands,
            Feed::CommandUpdates => &self.command_updates,
        }
    }

    pub fn notifications(&self) -> &SubscriptionRegistry {
        &self.notifications
    }

    pub fn commands(&self) -> &SubscriptionRegistry {
        &self.commands
    }

    pub fn command_updates(&self) -> &SubscriptionRegistry {
        &self.command_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{wake_pair, Subject};
    use waggle_common::ids::{DeviceId, WaitRequestId};

    #[test]
    fn feed_names_round_trip() {
        for feed in [Feed::Notifications, Feed::Commands, Feed::CommandUpdates] {
            assert_eq!(feed.as_str().parse::<Feed>().expect("parse"), feed);
        }
        assert!(matches!(
            "telemetry".parse::<Feed>(),
            Err(PollError::UnknownFeed(_))
        ));
    }

    #[test]
    fn feeds_do_not_cross_wake() {
        let hub = SubscriptionHub::new();
        let device = DeviceId::new();
        let (handle, _signal) = wake_pair();
        hub.commands()
            .insert(Subject::Device(device), WaitRequestId::new(), handle);

        // A notification for the same device must not touch command waiters.
        assert_eq!(hub.notifications().notify(device), 0);
        assert_eq!(hub.commands().subscription_count(), 1);
        assert_eq!(hub.commands().notify(device), 1);
    }
}
