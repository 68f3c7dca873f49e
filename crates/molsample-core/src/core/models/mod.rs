//! Data models for the modeled system: entity handles, interned attribute keys,
//! entities with their decorations, and the attribute store that owns them.

pub mod entity;
pub mod ids;
pub mod keys;
pub mod store;
