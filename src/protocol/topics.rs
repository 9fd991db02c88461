//! Topic construction and matching
//!
//! Unit topics are `{base}/{network}/{unit}/{kind}` where `kind` is `cmnd` for inbound
//! commands and `state` for published state. The liveness topic is fixed.

use thiserror::Error;

/// Liveness topic, independent of the configured base topic
pub const HEALTH_TOPIC: &str = "casambi/health/STATE";
/// Liveness payload
pub const HEALTH_PAYLOAD: &str = "OK";

/// Trailing segment of a unit topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    State,
}

impl MessageKind {
    pub fn suffix(self) -> &'static str {
        match self {
            MessageKind::Command => "cmnd",
            MessageKind::State => "state",
        }
    }
}

pub fn unit_topic(base: &str, network: &str, unit: &str, kind: MessageKind) -> String {
    format!("{base}/{network}/{unit}/{}", kind.suffix())
}

/// `{base}/{network}/{unit}/state`
pub fn state_topic(base: &str, network: &str, unit: &str) -> String {
    unit_topic(base, network, unit, MessageKind::State)
}

/// `{base}/{network}/{unit}/cmnd`
pub fn command_topic(base: &str, network: &str, unit: &str) -> String {
    unit_topic(base, network, unit, MessageKind::Command)
}

/// Recognises command topics of one network and extracts the unit name
///
/// Matching is a plain prefix/suffix split, so unit names are recovered verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopicMatcher {
    prefix: String,
    suffix: String,
}

impl CommandTopicMatcher {
    pub fn new(base: &str, network: &str) -> Self {
        Self {
            prefix: format!("{base}/{network}/"),
            suffix: format!("/{}", MessageKind::Command.suffix()),
        }
    }

    /// Unit name addressed by `topic`, or `None` when the topic is not a command topic
    /// of this network
    pub fn unit_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// Whether `level` can be used inside a concrete (non-wildcard) topic
pub fn is_publishable_level(level: &str) -> bool {
    !level.is_empty() && !level.contains(['+', '#', '\0'])
}

/// Validate the configured base topic
pub fn validate_base_topic(base: &str) -> Result<(), TopicError> {
    if base.is_empty() {
        return Err(TopicError::Empty);
    }
    if base.starts_with('/') || base.ends_with('/') {
        return Err(TopicError::StraySeparator(base.to_string()));
    }
    if let Some(ch) = base.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(TopicError::InvalidChar(ch));
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic '{0}' must not start or end with '/'")]
    StraySeparator(String),
    #[error("topic contains invalid character: '{0}'")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn command_and_state_differ_only_in_last_level(
            base in "[a-z]{1,8}",
            network in "[^/+#]{1,16}",
            unit in ".{1,24}",
        ) {
            let command = command_topic(&base, &network, &unit);
            let state = state_topic(&base, &network, &unit);

            let (command_head, command_tail) = command.rsplit_once('/').unwrap();
            let (state_head, state_tail) = state.rsplit_once('/').unwrap();
            prop_assert_eq!(command_head, state_head);
            prop_assert_eq!(command_tail, "cmnd");
            prop_assert_eq!(state_tail, "state");
        }

        #[test]
        fn matcher_recovers_unit_name(
            base in "[a-z]{1,8}",
            network in "[^/+#]{1,16}",
            unit in ".{1,24}",
        ) {
            let matcher = CommandTopicMatcher::new(&base, &network);
            let topic = command_topic(&base, &network, &unit);
            prop_assert_eq!(matcher.unit_name(&topic), Some(unit.as_str()));
        }
    }

    #[test]
    fn test_topic_layout() {
        assert_eq!(
            state_topic("casambi", "Home", "Lamp1"),
            "casambi/Home/Lamp1/state"
        );
        assert_eq!(
            command_topic("casambi", "Home", "Lamp1"),
            "casambi/Home/Lamp1/cmnd"
        );
        assert_eq!(
            unit_topic("a/b", "Net", "Desk Lamp", MessageKind::State),
            "a/b/Net/Desk Lamp/state"
        );
    }

    #[test]
    fn test_matcher_rejects_foreign_topics() {
        let matcher = CommandTopicMatcher::new("casambi", "Home");

        assert_eq!(matcher.unit_name("casambi/Home/Lamp1/cmnd"), Some("Lamp1"));
        assert_eq!(matcher.unit_name("casambi/Office/Lamp1/cmnd"), None);
        assert_eq!(matcher.unit_name("casambi/Home/Lamp1/state"), None);
        assert_eq!(matcher.unit_name("other/Home/Lamp1/cmnd"), None);
        assert_eq!(matcher.unit_name("casambi/Home//cmnd"), None);
        assert_eq!(matcher.unit_name("casambi/Home/cmnd"), None);
        assert_eq!(matcher.unit_name(HEALTH_TOPIC), None);
    }

    #[test]
    fn test_matcher_keeps_nested_levels() {
        let matcher = CommandTopicMatcher::new("casambi", "Home");
        assert_eq!(
            matcher.unit_name("casambi/Home/Kitchen/Spot/cmnd"),
            Some("Kitchen/Spot")
        );
    }

    #[test]
    fn test_publishable_level() {
        assert!(is_publishable_level("Lamp 1"));
        assert!(!is_publishable_level(""));
        assert!(!is_publishable_level("Lamp+"));
        assert!(!is_publishable_level("#"));
    }

    #[test]
    fn test_validate_base_topic() {
        assert!(validate_base_topic("casambi").is_ok());
        assert!(validate_base_topic("home/lights").is_ok());
        assert_eq!(validate_base_topic(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_base_topic("/casambi"),
            Err(TopicError::StraySeparator(_))
        ));
        assert!(matches!(
            validate_base_topic("casambi/"),
            Err(TopicError::StraySeparator(_))
        ));
        assert_eq!(
            validate_base_topic("casambi/+"),
            Err(TopicError::InvalidChar('+'))
        );
    }
}
