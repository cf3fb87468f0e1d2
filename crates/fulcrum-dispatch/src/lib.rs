//! Slot family cache and dispatcher: turns `family.advertise` traffic into
//! a queryable cache, and `slot.request` into a `slot.assignment` or
//! `slot.rejection`.

mod dispatcher;
mod family_cache;

pub use dispatcher::{Assignment, Dispatcher, COOLDOWN};
pub use family_cache::FamilyCache;
