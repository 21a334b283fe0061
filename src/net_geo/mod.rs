//! Network discovery plumbing
//!
//! Each stage sits behind a trait so the OS commands and the geolocation
//! service can be swapped for scripted sources.

pub mod resolver;
pub mod scanner;
pub mod tracer;

pub use resolver::{GeoService, HttpGeoService, Lookup, MaxMindGeoService, Resolver};
pub use scanner::{ConnectionRecord, ConnectionTable, NetstatCommand, Scanner};
pub use tracer::{HopTrace, HopTracer, TraceSource, TracerouteCommand};
