//! Container lifecycle events consumed by idle watchers

use crate::error::ProviderError;
use std::fmt;

/// Container actions an idle watcher subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Start,
    Unpause,
    Kill,
    Stop,
    Pause,
    Die,
    Destroy,
    /// The container was given a new name; the event carries the new one
    Rename,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Create,
        Action::Start,
        Action::Unpause,
        Action::Kill,
        Action::Stop,
        Action::Pause,
        Action::Die,
        Action::Destroy,
        Action::Rename,
    ];

    /// Parse a docker event action. Actions with a suffix such as
    /// `exec_start: sh` or `health_status: healthy` are not lifecycle events.
    pub fn from_docker(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Action::Create),
            "start" => Some(Action::Start),
            "unpause" => Some(Action::Unpause),
            "kill" => Some(Action::Kill),
            "stop" => Some(Action::Stop),
            "pause" => Some(Action::Pause),
            "die" => Some(Action::Die),
            "destroy" => Some(Action::Destroy),
            "rename" => Some(Action::Rename),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Unpause => "unpause",
            Action::Kill => "kill",
            Action::Stop => "stop",
            Action::Pause => "pause",
            Action::Die => "die",
            Action::Destroy => "destroy",
            Action::Rename => "rename",
        }
    }

    /// create / start / unpause
    pub fn is_wake(&self) -> bool {
        matches!(self, Action::Create | Action::Start | Action::Unpause)
    }

    /// stop / pause / die / kill
    pub fn is_sleep(&self) -> bool {
        matches!(self, Action::Kill | Action::Stop | Action::Pause | Action::Die)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event for one container, with the identity the provider
/// reported at the time of the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: Action,
    pub actor_id: String,
    pub actor_name: String,
}

impl fmt::Display for ContainerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.action, self.actor_name, self.actor_id)
    }
}

/// Messages delivered on a provider's watch channel.
#[derive(Debug)]
pub enum WatchMessage {
    Event(ContainerEvent),
    /// The subscription failed; the provider keeps retrying in the background.
    Error(ProviderError),
    /// The subscription was re-established after an error. Events may have
    /// been missed, so the container status should be inspected again.
    Resync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_and_sleep_classes_partition_lifecycle_actions() {
        for action in Action::ALL {
            if matches!(action, Action::Destroy | Action::Rename) {
                assert!(!action.is_wake() && !action.is_sleep());
            } else {
                assert_ne!(action.is_wake(), action.is_sleep(), "{action}");
            }
        }
    }

    #[test]
    fn test_from_docker() {
        assert_eq!(Action::from_docker("unpause"), Some(Action::Unpause));
        assert_eq!(Action::from_docker("die"), Some(Action::Die));
        assert_eq!(Action::from_docker("exec_start: sh"), None);
        assert_eq!(Action::from_docker("rename"), Some(Action::Rename));
        assert_eq!(Action::from_docker("update"), None);
        for action in Action::ALL {
            assert_eq!(Action::from_docker(action.as_str()), Some(action));
        }
    }
}
