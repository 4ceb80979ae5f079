//! Typed identifiers shared across the daemon.
//!
//! All identifiers are opaque strings on the wire. Newtypes keep a lease id
//! from ever being passed where a client id belongs; the cost is a handful
//! of `.as_str()` calls at the serialization boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap an existing identifier string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id! {
    /// Server-assigned identity of a connected client session.
    ClientId
}

opaque_id! {
    /// Stable identity of a physical device (VID/PID + serial-number hash),
    /// independent of the OS port path it currently enumerates under.
    DeviceId
}

opaque_id! {
    /// Identity of a granted device lease.
    LeaseId
}

opaque_id! {
    /// Correlation id echoed from a request onto its response.
    RequestId
}

/// Key identifying one build/flash target: the ordered triple of project
/// directory, environment name and port.
///
/// Keys are opaque: empty strings and non-ASCII text are valid components
/// and compare bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    /// Absolute or relative project directory, as sent by the client.
    pub project_dir: String,
    /// Environment name within the project (e.g. `esp32dev`).
    pub environment: String,
    /// Target port path (e.g. `/dev/ttyUSB0`), possibly empty for
    /// build-only targets.
    pub port: String,
}

impl ConfigKey {
    /// Build a key from its three components.
    #[must_use]
    pub fn new(
        project_dir: impl Into<String>,
        environment: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            environment: environment.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project_dir, self.environment, self.port)
    }
}
