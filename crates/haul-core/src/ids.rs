//! Branded ID newtypes.
//!
//! Rooms, jobs, sessions and connections each get their own string newtype so
//! a room id can never be passed where a job id is expected. Job and
//! connection ids are UUID v7 (time-ordered). Session tokens are opaque random
//! strings because they are handed to browsers and act as the only durable
//! identity of a client.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of random bytes in a freshly issued session token.
const TOKEN_BYTES: usize = 24;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

macro_rules! time_ordered {
    ($name:ident) => {
        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id! {
    /// Opaque durable client identity, persisted by the browser as a cookie.
    SessionToken
}

branded_id! {
    /// Scope that isolates job events to the session that started the job.
    RoomId
}

branded_id! {
    /// Identifier of one fetch-and-package job.
    JobId
}

branded_id! {
    /// Identifier of one live WebSocket connection.
    ConnectionId
}

time_ordered!(JobId);
time_ordered!(ConnectionId);

impl SessionToken {
    /// Issue a fresh unguessable token.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The room a session owns. One room per session; the ids share a value
    /// but stay distinct types so rooms can later hold several sessions.
    #[must_use]
    pub fn room(&self) -> RoomId {
        RoomId(self.0.clone())
    }
}
