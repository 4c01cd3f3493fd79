//! Domain models
//!
//! - `types` - catalog entities (devices, tags, people, locations, rules)
//!   and derived presence aggregates
//! - `alert` - alert event sessions and their keys
//! - `mac` - MAC address normalization

pub mod alert;
pub mod mac;
pub mod types;
