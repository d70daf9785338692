//! Utility module for serde of types.

pub mod generic_hashmap;
