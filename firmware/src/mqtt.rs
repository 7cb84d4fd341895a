//! Broker session settings derived from the stored preferences.
//!
//! The wire protocol is handled by `rust-mqtt` in the MQTT task; this module
//! only decides what that client is configured with.

use core::fmt;

use button_core::publish::Topic;
use button_core::state::Preferences;
use button_core::topics::{AVAILABLE_OFFLINE, TopicBuilder};

pub const DEFAULT_PORT: u16 = 1883;
pub const KEEP_ALIVE_SECS: u16 = 60;

/// Largest packet the client sends or accepts.
pub const MAX_PACKET_LEN: u32 = 512;

/// Client identifier derived from the station MAC, e.g. `HBTNS-A1B2C3`.
pub type ClientId = heapless::String<12>;

pub fn client_id(mac: [u8; 6]) -> ClientId {
    let mut id = ClientId::new();
    // Six prefix characters plus six hex digits always fit.
    let _ = fmt::write(
        &mut id,
        format_args!("HBTNS-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]),
    );
    id
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
}

/// Everything the broker connection needs, borrowed from the preferences.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSettings<'a> {
    pub server: &'a str,
    pub port: u16,
    pub credentials: Option<Credentials<'a>>,
    pub will_topic: Topic,
    pub will_payload: &'static [u8],
}

impl<'a> SessionSettings<'a> {
    #[must_use]
    pub fn from_prefs(prefs: &'a Preferences) -> Self {
        let broker = &prefs.broker;
        let port = match broker.port {
            0 => DEFAULT_PORT,
            port => port,
        };
        // A user without a password, or the reverse, connects anonymously.
        let credentials =
            (!broker.user.is_empty() && !broker.password.is_empty()).then(|| Credentials {
                user: broker.user.as_str(),
                password: broker.password.as_str(),
            });
        Self {
            server: broker.server.as_str(),
            port,
            credentials,
            will_topic: TopicBuilder::from_prefs(prefs).awake_mode_available(),
            will_payload: AVAILABLE_OFFLINE.as_bytes(),
        }
    }

    #[must_use]
    pub fn has_server(&self) -> bool {
        !self.server.is_empty()
    }
}
