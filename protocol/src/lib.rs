//! Wire protocol shared between the hub and the sources/subscribers that
//! talk to it: the JSON message envelope, the per-object payload schemas,
//! canonicalization for digesting, and the tunable configuration knobs.
//!
//! Nothing in this crate touches a socket — it only describes bytes on the
//! wire and the rules for turning raw JSON into validated, normalized data.

pub mod canonical;
pub mod config;
pub mod message;
pub mod model;

pub use canonical::state_digest;
pub use config::HubConfig;
pub use message::*;
pub use model::{
    identity_keys, normalize_mark_color, EntityData, PlayerData, PlayerMark, Schema,
    TabPlayerEntry, Team, ValidationError, WaypointData,
};
