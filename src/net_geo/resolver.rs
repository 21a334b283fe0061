//! IP geolocation with a per-session cache
//!
//! Two backends answer lookups: an HTTP geolocation service (default
//! geolocation-db.com) and an offline MaxMind GeoLite2 database. The
//! external-IP lookup for the local host always goes over HTTP.

use crate::error::{Error, Result};
use crate::geo::GeoCoordinate;
use crate::lock;
use crate::settings::{GeoBackend, ResolverSettings};
use maxminddb::{geoip2, MaxMindDBError, Reader};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a lookup that reached the service
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Lookup {
    Found(GeoCoordinate),
    /// Service has no position for this address
    NotFound,
}

impl Lookup {
    pub fn coordinate(self) -> Option<GeoCoordinate> {
        match self {
            Lookup::Found(coordinate) => Some(coordinate),
            Lookup::NotFound => None,
        }
    }
}

/// External geolocation service
pub trait GeoService: Send + Sync {
    fn lookup(&self, ip: &str) -> Result<Lookup>;

    /// Public IP of the calling host
    fn external_ip(&self) -> Result<String>;
}

// ============================================================================
// HTTP backend
// ============================================================================

pub struct HttpGeoService {
    geolocation_url: String,
    external_ip_url: String,
    timeout: Duration,
}

impl HttpGeoService {
    pub fn new(geolocation_url: impl Into<String>, external_ip_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            geolocation_url: geolocation_url.into(),
            external_ip_url: external_ip_url.into(),
            timeout,
        }
    }
}

impl GeoService for HttpGeoService {
    fn lookup(&self, ip: &str) -> Result<Lookup> {
        let url = format!("{}{}", self.geolocation_url, ip.trim());
        let body = ureq::get(&url)
            .timeout(self.timeout)
            .call()?
            .into_string()
            .map_err(|e| Error::ResolverUnavailable(format!("reading {}: {}", url, e)))?;

        parse_lookup_response(&body)
    }

    fn external_ip(&self) -> Result<String> {
        fetch_external_ip(&self.external_ip_url, self.timeout)
    }
}

fn fetch_external_ip(url: &str, timeout: Duration) -> Result<String> {
    let body = ureq::get(url)
        .timeout(timeout)
        .call()?
        .into_string()
        .map_err(|e| Error::ResolverUnavailable(format!("reading {}: {}", url, e)))?;

    let ip = body.trim();
    ip.parse::<IpAddr>()
        .map_err(|_| Error::ResolverUnavailable(format!("{} returned {:?}, not an IP", url, ip)))?;
    Ok(ip.to_string())
}

#[derive(Deserialize)]
struct GeoResponse {
    #[serde(default)]
    latitude: Value,
    #[serde(default)]
    longitude: Value,
}

/// Parse a geolocation payload. A non-numeric latitude (`"Not found"`) or
/// a missing one means the service has no position for the address.
pub fn parse_lookup_response(body: &str) -> Result<Lookup> {
    let json = strip_jsonp(body.trim());
    let response: GeoResponse = serde_json::from_str(json)
        .map_err(|e| Error::ResolverUnavailable(format!("malformed geolocation response: {}", e)))?;

    let Some(lat) = number(&response.latitude) else {
        return Ok(Lookup::NotFound);
    };
    let lon = number(&response.longitude).ok_or_else(|| {
        Error::ResolverUnavailable(format!("latitude without longitude: {}", response.longitude))
    })?;

    Ok(Lookup::Found(GeoCoordinate::new(lat, lon)?))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `callback({...})` -> `{...}`
fn strip_jsonp(body: &str) -> &str {
    if body.starts_with('{') {
        return body;
    }
    match (body.find('('), body.rfind(')')) {
        (Some(open), Some(close)) if open < close => &body[open + 1..close],
        _ => body,
    }
}

// ============================================================================
// MaxMind backend
// ============================================================================

/// GeoLite2-City database reader
pub struct MaxMindGeoService {
    reader: Reader<Vec<u8>>,
    external_ip_url: String,
    timeout: Duration,
}

impl MaxMindGeoService {
    pub fn open(path: &Path, external_ip_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let reader = Reader::open_readfile(path)
            .map_err(|e| Error::Config(format!("opening {}: {}", path.display(), e)))?;
        info!("Loaded GeoIP database {}", path.display());
        Ok(Self {
            reader,
            external_ip_url: external_ip_url.into(),
            timeout,
        })
    }

    /// Explicit path first, then the usual install locations
    pub fn find_database(explicit_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit_path {
            if path.exists() {
                return Some(path.to_path_buf());
            }
        }

        let candidates = [
            dirs::config_dir().map(|p| p.join("netglobe/GeoLite2-City.mmdb")),
            Some(PathBuf::from("/usr/share/GeoIP/GeoLite2-City.mmdb")),
            Some(PathBuf::from("/var/lib/GeoIP/GeoLite2-City.mmdb")),
            Some(PathBuf::from("./GeoLite2-City.mmdb")),
        ];

        candidates.into_iter().flatten().find(|p| p.exists())
    }
}

impl GeoService for MaxMindGeoService {
    fn lookup(&self, ip: &str) -> Result<Lookup> {
        let Ok(addr) = ip.trim().parse::<IpAddr>() else {
            return Ok(Lookup::NotFound);
        };

        match self.reader.lookup::<geoip2::City>(addr) {
            Ok(city) => {
                let position = city
                    .location
                    .and_then(|location| Some((location.latitude?, location.longitude?)));
                match position {
                    Some((lat, lon)) => Ok(Lookup::Found(GeoCoordinate::new(lat, lon)?)),
                    None => Ok(Lookup::NotFound),
                }
            }
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(Lookup::NotFound),
            Err(e) => Err(Error::ResolverUnavailable(e.to_string())),
        }
    }

    fn external_ip(&self) -> Result<String> {
        fetch_external_ip(&self.external_ip_url, self.timeout)
    }
}

// ============================================================================
// Resolver
// ============================================================================

type Slot = Arc<Mutex<Option<GeoCoordinate>>>;

/// Caching front of a [`GeoService`].
///
/// Successful lookups are kept for the life of the resolver; "not found"
/// is not cached, so the address is retried on a later call. Concurrent
/// callers for the same IP wait on one shared slot instead of issuing
/// duplicate requests.
pub struct Resolver {
    service: Box<dyn GeoService>,
    cache: Mutex<HashMap<String, Slot>>,
}

impl Resolver {
    pub fn new(service: impl GeoService + 'static) -> Self {
        Self {
            service: Box::new(service),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &ResolverSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        match settings.backend {
            GeoBackend::Http => Ok(Self::new(HttpGeoService::new(
                &settings.geolocation_url,
                &settings.external_ip_url,
                timeout,
            ))),
            GeoBackend::MaxMind => {
                let path = MaxMindGeoService::find_database(settings.geoip_db.as_deref())
                    .ok_or_else(|| Error::Config("no GeoLite2-City database found".to_string()))?;
                Ok(Self::new(MaxMindGeoService::open(
                    &path,
                    &settings.external_ip_url,
                    timeout,
                )?))
            }
        }
    }

    pub fn resolve(&self, ip: &str) -> Result<Lookup> {
        let slot = lock(&self.cache).entry(ip.to_string()).or_default().clone();
        let mut slot = lock(&slot);

        if let Some(coordinate) = *slot {
            debug!("cache hit for {}", ip);
            return Ok(Lookup::Found(coordinate));
        }

        let lookup = self.service.lookup(ip)?;
        match lookup {
            Lookup::Found(coordinate) => {
                info!("{} located at {:.4}, {:.4}", ip, coordinate.lat, coordinate.lon);
                *slot = Some(coordinate);
            }
            Lookup::NotFound => debug!("no location for {}", ip),
        }
        Ok(lookup)
    }

    /// Cached position for `ip`, without calling the service
    pub fn cached_location(&self, ip: &str) -> Option<GeoCoordinate> {
        let slot = lock(&self.cache).get(ip).cloned()?;
        let location = *lock(&slot);
        location
    }

    /// External IP of this host and its location
    pub fn resolve_self(&self) -> Result<(String, Lookup)> {
        let ip = self.service.external_ip()?;
        info!("external IP is {}", ip);
        let lookup = self.resolve(&ip)?;
        Ok((ip, lookup))
    }

    /// Number of addresses with a cached position
    pub fn cached(&self) -> usize {
        lock(&self.cache)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        body: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl GeoService for Counting {
        fn lookup(&self, _ip: &str) -> Result<Lookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            parse_lookup_response(self.body)
        }

        fn external_ip(&self) -> Result<String> {
            Ok("198.51.100.1".to_string())
        }
    }

    struct Down;

    impl GeoService for Down {
        fn lookup(&self, _ip: &str) -> Result<Lookup> {
            Err(Error::ResolverUnavailable("connection refused".to_string()))
        }

        fn external_ip(&self) -> Result<String> {
            Err(Error::ResolverUnavailable("connection refused".to_string()))
        }
    }

    fn counting(body: &'static str) -> (Resolver, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Resolver::new(Counting { body, calls: calls.clone() });
        (resolver, calls)
    }

    #[test]
    fn parses_numeric_position() {
        let lookup = parse_lookup_response(r#"{"country_code":"US","latitude":37.4,"longitude":-122.1}"#).unwrap();
        assert_eq!(lookup, Lookup::Found(GeoCoordinate { lat: 37.4, lon: -122.1 }));
    }

    #[test]
    fn not_found_latitude_is_not_an_error() {
        let lookup = parse_lookup_response(
            r#"{"country_code":"Not found","latitude":"Not found","longitude":"Not found","IPv4":"10.0.0.1"}"#,
        )
        .unwrap();
        assert_eq!(lookup, Lookup::NotFound);
    }

    #[test]
    fn strips_jsonp_wrapper() {
        let lookup = parse_lookup_response(r#"callback({"latitude":"48.2","longitude":"16.37"})"#).unwrap();
        assert_eq!(lookup, Lookup::Found(GeoCoordinate { lat: 48.2, lon: 16.37 }));
    }

    #[test]
    fn malformed_payload_is_unavailable() {
        assert!(matches!(parse_lookup_response("<html>502</html>"), Err(Error::ResolverUnavailable(_))));
        assert!(matches!(
            parse_lookup_response(r#"{"latitude":10.0}"#),
            Err(Error::ResolverUnavailable(_))
        ));
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        assert!(matches!(
            parse_lookup_response(r#"{"latitude":123.0,"longitude":0.0}"#),
            Err(Error::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn second_resolve_hits_cache() {
        let (resolver, calls) = counting(r#"{"latitude":37.4,"longitude":-122.1}"#);
        let first = resolver.resolve("203.0.113.5").unwrap();
        let second = resolver.resolve("203.0.113.5").unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn cached_location_never_calls_the_service() {
        let (resolver, calls) = counting(r#"{"latitude":37.4,"longitude":-122.1}"#);
        assert_eq!(resolver.cached_location("203.0.113.5"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        resolver.resolve("203.0.113.5").unwrap();
        assert_eq!(resolver.cached_location("203.0.113.5"), Some(GeoCoordinate { lat: 37.4, lon: -122.1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_found_is_retried() {
        let (resolver, calls) = counting(r#"{"latitude":"Not found","longitude":"Not found"}"#);
        assert_eq!(resolver.resolve("10.1.1.1").unwrap(), Lookup::NotFound);
        assert_eq!(resolver.resolve("10.1.1.1").unwrap(), Lookup::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached(), 0);
    }

    #[test]
    fn resolve_self_uses_external_ip() {
        let (resolver, calls) = counting(r#"{"latitude":51.5,"longitude":-0.1}"#);
        let (ip, lookup) = resolver.resolve_self().unwrap();
        assert_eq!(ip, "198.51.100.1");
        assert_eq!(lookup.coordinate(), Some(GeoCoordinate { lat: 51.5, lon: -0.1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_service_propagates() {
        let resolver = Resolver::new(Down);
        assert!(matches!(resolver.resolve("8.8.8.8"), Err(Error::ResolverUnavailable(_))));
        assert!(matches!(resolver.resolve_self(), Err(Error::ResolverUnavailable(_))));
    }

    #[test]
    fn concurrent_resolves_share_one_call() {
        let (resolver, calls) = counting(r#"{"latitude":1.0,"longitude":2.0}"#);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| resolver.resolve("192.0.2.7").unwrap());
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
