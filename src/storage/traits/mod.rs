//! Storage backend traits.

mod activity;
mod geofence;
mod session;

pub use activity::{ActivityBackend, SequencedEvent, StoredAppend};
pub use geofence::GeofenceBackend;
pub use session::SessionBackend;
