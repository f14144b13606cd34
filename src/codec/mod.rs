//! translation between in-memory proxy configuration and the exact textual
//! forms the proxies accept. the codec never decides which servers belong in
//! a config; that policy lives with the fleet reconciler.

pub mod bungee;
pub mod velocity;
