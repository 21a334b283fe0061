//! Live network topology discovery.
//!
//! Samples the connection table, geolocates every remote peer, walks
//! traceroute paths towards new peers and keeps the result in a
//! [`TopologyRegistry`] that renderers can snapshot or subscribe to.

pub mod error;
pub mod geo;
pub mod net_geo;
pub mod session;
pub mod settings;
pub mod topology;

pub use error::{Error, Result};
pub use geo::{great_circle_path, normalize_angle, GeoCoordinate, GreatCircle, PlaneVector, SpaceVector};
pub use session::{Session, SessionOptions};
pub use settings::Settings;
pub use topology::{NodeContext, NodeMetadata, NodeRole, RefreshReport, TopologyEvent, TopologyNode, TopologyRegistry, Upsert};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
