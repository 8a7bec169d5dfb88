//! Types shared across the companion trust agent: the wire message schema,
//! the symmetric key contracts and a handful of small utilities.

pub mod keys;
pub mod messages;
pub mod utils;
