//! Connection table scanning
//!
//! Runs the OS connection-listing command (`netstat -natp` by default),
//! zips each row against the header columns and derives the unique set of
//! remote peers.

use crate::error::{Error, Result};
use crate::settings::ScannerSettings;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::process::Command;
use tracing::debug;

/// Remote addresses that never count as peers
pub const IGNORED_ADDRESSES: [&str; 2] = ["0.0.0.0", "127.0.0.1"];

// ============================================================================
// ConnectionRecord
// ============================================================================

/// One row of the connection table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub protocol: String,
    pub local: String,
    pub remote: String,
    /// ESTABLISHED, TIME_WAIT, ... (empty when the table has no state column)
    pub state: String,
    /// Every column as printed, keyed by lowercased header name
    pub columns: BTreeMap<String, String>,
}

impl ConnectionRecord {
    fn from_columns(columns: BTreeMap<String, String>) -> Option<Self> {
        let local = columns.get("local")?.clone();
        let remote = columns.get("foreign")?.clone();
        let protocol = columns.get("proto").cloned().unwrap_or_default();
        let state = columns.get("state").cloned().unwrap_or_default();
        Some(Self {
            protocol,
            local,
            remote,
            state,
            columns,
        })
    }

    /// Remote address split on its last colon into (ip, port)
    pub fn remote_endpoint(&self) -> Option<(&str, &str)> {
        self.remote.rsplit_once(':')
    }
}

// ============================================================================
// Table sources
// ============================================================================

/// Source of raw connection-table text
pub trait ConnectionTable: Send + Sync {
    fn read_table(&self) -> Result<String>;
}

/// Runs a listing command and captures its stdout
pub struct NetstatCommand {
    program: String,
    args: Vec<String>,
}

impl NetstatCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for NetstatCommand {
    fn default() -> Self {
        Self::new("netstat", vec!["-natp".to_string()])
    }
}

impl ConnectionTable for NetstatCommand {
    fn read_table(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::Scan(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scan(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ============================================================================
// Scanner
// ============================================================================

pub struct Scanner {
    table: Box<dyn ConnectionTable>,
    ignore: HashSet<String>,
}

impl Scanner {
    pub fn new(table: impl ConnectionTable + 'static) -> Self {
        Self {
            table: Box::new(table),
            ignore: IGNORED_ADDRESSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_settings(settings: &ScannerSettings) -> Self {
        Self::new(NetstatCommand::new(&settings.command, settings.args.clone()))
            .with_ignored(settings.ignore.iter().cloned())
    }

    /// Add addresses to this scanner's ignore set
    pub fn with_ignored(mut self, ips: impl IntoIterator<Item = String>) -> Self {
        self.ignore.extend(ips);
        self
    }

    /// Read the connection table once
    pub fn scan(&self) -> Result<Vec<ConnectionRecord>> {
        let text = self.table.read_table()?;
        parse_table(&text)
    }

    /// Unique remote peers, first record per IP wins
    pub fn list_foreign_peers(&self) -> Result<Vec<(String, ConnectionRecord)>> {
        let mut emitted: HashSet<String> = HashSet::new();
        let mut peers = Vec::new();

        for record in self.scan()? {
            let Some((ip, _port)) = record.remote_endpoint() else {
                continue;
            };
            if self.is_ignored(ip) || emitted.contains(ip) {
                continue;
            }
            let ip = ip.to_string();
            emitted.insert(ip.clone());
            peers.push((ip, record));
        }

        Ok(peers)
    }

    fn is_ignored(&self, ip: &str) -> bool {
        if ip.is_empty() || self.ignore.contains(ip) {
            return true;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => addr.is_loopback() || addr.is_unspecified(),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse connection-table text into records.
///
/// The header is the first line starting with `Proto`. Rows whose token
/// count does not match the columns are dropped, unless the surplus can be
/// folded into a multi-word last column.
pub fn parse_table(text: &str) -> Result<Vec<ConnectionRecord>> {
    let mut lines = text.lines();
    let header = lines
        .by_ref()
        .find(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case("proto"))
        })
        .ok_or_else(|| Error::Scan("no header row in connection table".to_string()))?;

    let headers = parse_header(header);
    let mut records = Vec::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match zip_row(&headers, line).and_then(ConnectionRecord::from_columns) {
            Some(record) => records.push(record),
            None => debug!("dropping malformed row: {}", line.trim()),
        }
    }

    Ok(records)
}

/// Column names, lowercased. `Address` words are dropped and lowercase
/// continuation words (`PID/Program name`) join the previous column.
fn parse_header(line: &str) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for token in line.split_whitespace() {
        if token == "Address" {
            continue;
        }
        let continues = token.chars().next().is_some_and(|c| c.is_lowercase());
        match headers.last_mut() {
            Some(last) if continues => {
                last.push(' ');
                last.push_str(token);
            }
            _ => headers.push(token.to_string()),
        }
    }
    headers.iter().map(|h| h.to_lowercase()).collect()
}

/// Zip a row against the header. A column-count mismatch drops the row,
/// except that a multi-word last column (`pid/program name`) takes every
/// surplus token, since its values can contain spaces.
fn zip_row(headers: &[String], line: &str) -> Option<BTreeMap<String, String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let last_is_free_text = headers.last().is_some_and(|h| h.contains(' '));
    if headers.is_empty()
        || tokens.len() < headers.len()
        || (tokens.len() > headers.len() && !last_is_free_text)
    {
        return None;
    }

    let last = headers.len() - 1;
    let mut columns: BTreeMap<String, String> = headers[..last]
        .iter()
        .cloned()
        .zip(tokens.iter().map(|t| t.to_string()))
        .collect();
    columns.insert(headers[last].clone(), tokens[last..].join(" "));

    Some(columns)
}
