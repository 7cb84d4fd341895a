//! Broker topic layout and inbound command parsing.
//!
//! Every topic lives under `<base_topic>/<device_name>/`; commands arrive
//! under the `cmd/` sub-tree, which is subscribed as a whole.

use core::fmt::{self, Write as _};

use winnow::ascii::{dec_uint, space0};
use winnow::combinator::{alt, delimited};
use winnow::prelude::*;

use crate::gesture::{Action, ButtonId};
use crate::publish::Topic;
use crate::state::{ButtonLabel, Preferences, SENSOR_INTERVAL_MAX, SENSOR_INTERVAL_MIN, truncated};

/// Payload published for every click gesture.
pub const BUTTON_PRESS_PAYLOAD: &str = "PRESS";
pub const AVAILABLE_ONLINE: &str = "online";
pub const AVAILABLE_OFFLINE: &str = "offline";
pub const SWITCH_ON: &str = "ON";
pub const SWITCH_OFF: &str = "OFF";

/// Builds topics for one device.
#[derive(Copy, Clone, Debug)]
pub struct TopicBuilder<'a> {
    base: &'a str,
    name: &'a str,
}

impl<'a> TopicBuilder<'a> {
    #[must_use]
    pub const fn new(base: &'a str, name: &'a str) -> Self {
        Self { base, name }
    }

    #[must_use]
    pub fn from_prefs(prefs: &'a Preferences) -> Self {
        Self::new(prefs.broker.base_topic.as_str(), prefs.device_name.as_str())
    }

    // Base, name and suffix lengths are bounded so the longest topic fits.
    fn compose(&self, args: fmt::Arguments<'_>) -> Topic {
        let mut topic = Topic::new();
        let _ = write!(topic, "{}/{}/{}", self.base, self.name, args);
        topic
    }

    #[must_use]
    pub fn common(&self) -> Topic {
        self.compose(format_args!(""))
    }

    /// Wildcard filter covering every command topic.
    #[must_use]
    pub fn command_filter(&self) -> Topic {
        self.compose(format_args!("cmd/#"))
    }

    /// Topic for a click gesture; long presses are never published.
    #[must_use]
    pub fn button(&self, id: ButtonId, action: Action) -> Option<Topic> {
        let suffix = match action {
            Action::Single => "",
            Action::Double => "_double",
            Action::Triple => "_triple",
            Action::Quad => "_quad",
            Action::Idle | Action::Long(_) => return None,
        };
        Some(self.compose(format_args!("button_{}{suffix}", id.get())))
    }

    #[must_use]
    pub fn temperature(&self) -> Topic {
        self.compose(format_args!("temperature"))
    }

    #[must_use]
    pub fn humidity(&self) -> Topic {
        self.compose(format_args!("humidity"))
    }

    #[must_use]
    pub fn battery(&self) -> Topic {
        self.compose(format_args!("battery"))
    }

    #[must_use]
    pub fn sensor_interval_state(&self) -> Topic {
        self.compose(format_args!("sensor_interval"))
    }

    #[must_use]
    pub fn sensor_interval_cmd(&self) -> Topic {
        self.compose(format_args!("cmd/sensor_interval"))
    }

    #[must_use]
    pub fn button_label_state(&self, id: ButtonId) -> Topic {
        self.compose(format_args!("btn_{}_label", id.get()))
    }

    #[must_use]
    pub fn button_label_cmd(&self, id: ButtonId) -> Topic {
        self.compose(format_args!("cmd/btn_{}_label", id.get()))
    }

    #[must_use]
    pub fn awake_mode_state(&self) -> Topic {
        self.compose(format_args!("awake_mode"))
    }

    #[must_use]
    pub fn awake_mode_cmd(&self) -> Topic {
        self.compose(format_args!("cmd/awake_mode"))
    }

    #[must_use]
    pub fn awake_mode_available(&self) -> Topic {
        self.compose(format_args!("awake_mode/available"))
    }

    /// Returns the command topic a [`CommandTopic`] arrives on.
    #[must_use]
    pub fn command_topic(&self, topic: CommandTopic) -> Topic {
        match topic {
            CommandTopic::SensorInterval => self.sensor_interval_cmd(),
            CommandTopic::ButtonLabel(id) => self.button_label_cmd(id),
            CommandTopic::AwakeMode => self.awake_mode_cmd(),
        }
    }

    /// Parses an inbound message into a device command.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotACommand`] for topics outside this device's command
    /// tree, [`CommandError::Cleared`] for the empty payload that clears a
    /// retained command, and [`CommandError::InvalidPayload`] when the value
    /// does not parse or is out of range.
    pub fn parse_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<DeviceCommand, CommandError> {
        let suffix = topic
            .strip_prefix(self.base)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_prefix(self.name))
            .and_then(|rest| rest.strip_prefix("/cmd/"))
            .ok_or(CommandError::NotACommand)?;
        let command_topic = command_topic
            .parse(suffix)
            .map_err(|_| CommandError::NotACommand)?;

        if payload.is_empty() {
            return Err(CommandError::Cleared(command_topic));
        }
        let text = core::str::from_utf8(payload)
            .map_err(|_| CommandError::InvalidPayload(command_topic))?;

        let parsed = match command_topic {
            CommandTopic::SensorInterval => interval_payload
                .parse(text)
                .ok()
                .map(DeviceCommand::SensorInterval),
            CommandTopic::AwakeMode => {
                switch_payload.parse(text).ok().map(DeviceCommand::AwakeMode)
            }
            CommandTopic::ButtonLabel(id) => Some(DeviceCommand::ButtonLabel {
                id,
                label: truncated(text),
            }),
        };
        parsed.ok_or(CommandError::InvalidPayload(command_topic))
    }
}

/// Command topics understood by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandTopic {
    SensorInterval,
    ButtonLabel(ButtonId),
    AwakeMode,
}

/// Validated remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceCommand {
    SensorInterval(u8),
    ButtonLabel { id: ButtonId, label: ButtonLabel },
    AwakeMode(bool),
}

impl DeviceCommand {
    #[must_use]
    pub const fn topic(&self) -> CommandTopic {
        match self {
            DeviceCommand::SensorInterval(_) => CommandTopic::SensorInterval,
            DeviceCommand::ButtonLabel { id, .. } => CommandTopic::ButtonLabel(*id),
            DeviceCommand::AwakeMode(_) => CommandTopic::AwakeMode,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    NotACommand,
    Cleared(CommandTopic),
    InvalidPayload(CommandTopic),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

fn command_topic(input: &mut &str) -> ModalResult<CommandTopic> {
    alt((
        "sensor_interval".value(CommandTopic::SensorInterval),
        "awake_mode".value(CommandTopic::AwakeMode),
        delimited(
            "btn_",
            dec_uint::<_, u8, _>.verify_map(ButtonId::new),
            "_label",
        )
        .map(CommandTopic::ButtonLabel),
    ))
    .parse_next(input)
}

fn interval_payload(input: &mut &str) -> ModalResult<u8> {
    delimited(
        space0,
        dec_uint::<_, u8, _>
            .verify(|minutes: &u8| (SENSOR_INTERVAL_MIN..=SENSOR_INTERVAL_MAX).contains(minutes)),
        space0,
    )
    .parse_next(input)
}

fn switch_payload(input: &mut &str) -> ModalResult<bool> {
    alt((SWITCH_ON.value(true), SWITCH_OFF.value(false))).parse_next(input)
}
