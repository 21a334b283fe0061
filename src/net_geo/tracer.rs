//! Traceroute hop discovery
//!
//! Streams a traceroute subprocess line by line and turns every located
//! hop into a [`TopologyNode`], each linked from the last hop that could
//! be located.

use super::resolver::{Lookup, Resolver};
use crate::error::{Error, Result};
use crate::geo::GeoCoordinate;
use crate::settings::TracerSettings;
use crate::topology::{NodeMetadata, NodeRole, TopologyNode, DEFAULT_NODE_RADIUS};
use std::io::{self, BufRead, BufReader, Lines, Read};
use std::net::IpAddr;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

/// Starts a trace and hands back its output as it is produced
pub trait TraceSource: Send + Sync {
    fn start(&self, destination: &str) -> Result<Box<dyn BufRead + Send>>;
}

// ============================================================================
// traceroute subprocess
// ============================================================================

pub struct TracerouteCommand {
    program: String,
    args: Vec<String>,
}

impl TracerouteCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl TraceSource for TracerouteCommand {
    fn start(&self, destination: &str) -> Result<Box<dyn BufRead + Send>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(destination)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Trace(format!("{} {}: {}", self.program, destination, e)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Trace(format!("{} produced no stdout", self.program)));
        };

        Ok(Box::new(ChildOutput {
            reader: BufReader::new(stdout),
            child,
        }))
    }
}

/// Child stdout that kills and reaps the process when dropped
struct ChildOutput {
    reader: BufReader<ChildStdout>,
    child: Child,
}

impl Read for ChildOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for ChildOutput {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Drop for ChildOutput {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ============================================================================
// HopTracer
// ============================================================================

pub struct HopTracer {
    source: Box<dyn TraceSource>,
    radius: f64,
}

impl HopTracer {
    pub fn new(source: impl TraceSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            radius: DEFAULT_NODE_RADIUS,
        }
    }

    pub fn from_settings(settings: &TracerSettings) -> Self {
        Self::new(TracerouteCommand::new(&settings.command, settings.args.clone()))
    }

    /// Radius of the sphere hop positions are placed on
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    /// Start tracing `destination`. Hops are yielded as the trace reports
    /// them, followed by one target node for the destination itself.
    pub fn trace<'a>(
        &self,
        destination: &str,
        resolver: &'a Resolver,
        start: Option<GeoCoordinate>,
    ) -> Result<HopTrace<'a>> {
        info!("tracing {}", destination);
        let reader = self.source.start(destination)?;

        Ok(HopTrace {
            lines: reader.lines(),
            resolver,
            destination: destination.to_string(),
            last_known: start,
            radius: self.radius,
            first_attempt: None,
            header_skipped: false,
            stage: Stage::Hops,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Hops,
    Target,
    Done,
}

/// One-shot stream of trace nodes
pub struct HopTrace<'a> {
    lines: Lines<Box<dyn BufRead + Send>>,
    resolver: &'a Resolver,
    destination: String,
    last_known: Option<GeoCoordinate>,
    radius: f64,
    first_attempt: Option<&'a dyn Fn(&str) -> bool>,
    header_skipped: bool,
    stage: Stage,
}

impl<'a> HopTrace<'a> {
    /// Only query the service for an uncached IP when `first_attempt`
    /// returns true for it. Cached positions are always used.
    pub fn with_attempt_guard(mut self, first_attempt: &'a dyn Fn(&str) -> bool) -> Self {
        self.first_attempt = Some(first_attempt);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn locate(&self, ip: &str, what: &str) -> Option<GeoCoordinate> {
        if let Some(location) = self.resolver.cached_location(ip) {
            return Some(location);
        }
        if let Some(first_attempt) = self.first_attempt {
            if !first_attempt(ip) {
                debug!("{} {} already attempted this cycle", what, ip);
                return None;
            }
        }

        match self.resolver.resolve(ip) {
            Ok(Lookup::Found(location)) => Some(location),
            Ok(Lookup::NotFound) => {
                warn!("no location for {} {}", what, ip);
                None
            }
            Err(e) => {
                warn!("locating {} {} failed: {}", what, ip, e);
                None
            }
        }
    }

    fn next_line(&mut self) -> Option<String> {
        match self.lines.next() {
            Some(Ok(line)) => Some(line),
            Some(Err(e)) => {
                warn!("reading trace output for {} failed: {}", self.destination, e);
                None
            }
            None => None,
        }
    }

    fn hop_node(&mut self, ip: &str) -> Option<TopologyNode> {
        let location = self.locate(ip, "hop")?;

        debug!("hop {} towards {}", ip, self.destination);
        let node = TopologyNode::new(
            ip,
            location,
            NodeRole::TracerouteHop,
            NodeMetadata::Trace {
                target: self.destination.clone(),
            },
            self.last_known,
            self.radius,
        );
        self.last_known = Some(location);
        Some(node)
    }

    fn target_node(&self) -> Option<TopologyNode> {
        let location = self.locate(&self.destination, "trace target")?;

        info!("done tracing {}", self.destination);
        Some(TopologyNode::new(
            self.destination.clone(),
            location,
            NodeRole::TracerouteTarget,
            NodeMetadata::Trace {
                target: self.destination.clone(),
            },
            self.last_known,
            self.radius,
        ))
    }
}

impl Iterator for HopTrace<'_> {
    type Item = TopologyNode;

    fn next(&mut self) -> Option<TopologyNode> {
        loop {
            match self.stage {
                Stage::Done => return None,
                Stage::Target => {
                    self.stage = Stage::Done;
                    return self.target_node();
                }
                Stage::Hops => {
                    let Some(line) = self.next_line() else {
                        self.stage = Stage::Target;
                        continue;
                    };
                    if !self.header_skipped {
                        self.header_skipped = true;
                        continue;
                    }
                    let Some(ip) = hop_ip(&line) else {
                        continue;
                    };
                    if ip == self.destination {
                        self.stage = Stage::Target;
                        continue;
                    }
                    if let Some(node) = self.hop_node(&ip) {
                        return Some(node);
                    }
                }
            }
        }
    }
}

/// IP of a hop line. Lines with a `*` timeout marker carry none.
///
/// ` 2  isp-edge.example.net (198.51.100.1)  8.1 ms` -> `198.51.100.1`;
/// numeric output (` 2  198.51.100.1  8.1 ms`) falls back to the second token.
pub fn hop_ip(line: &str) -> Option<String> {
    if line.contains('*') {
        return None;
    }

    if let Some(open) = line.find('(') {
        let rest = &line[open + 1..];
        let ip = rest.split(')').next()?.trim();
        return (!ip.is_empty()).then(|| ip.to_string());
    }

    let token = line.split_whitespace().nth(1)?;
    token.parse::<IpAddr>().ok().map(|_| token.to_string())
}
