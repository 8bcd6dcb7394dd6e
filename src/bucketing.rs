//! Classification of requests into throttling buckets.
//!
//! A bucket key is the equivalence class a request is accounted under. The
//! filter composes three strategies in priority order: known-expensive query
//! shapes (regex over the `query` parameter), generic agents (regex over
//! `User-Agent`), and finally the (IP, User-Agent) pair, which always yields
//! a key.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use crate::request::ClientRequest;

/// Opaque identity of a throttling bucket. Requests with equal keys share
/// throttling state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// All requests whose `query` parameter matches one known-expensive
    /// pattern; the key is the pattern's source string.
    QueryPattern(String),
    /// All requests whose `User-Agent` matches one generic-agent pattern.
    AgentPattern(String),
    /// The default segmentation: one bucket per (IP, User-Agent) pair.
    Client { ip: IpAddr, agent: String },
}

/// A strategy mapping a request to a bucket key, or to "no opinion".
pub trait Bucketing: Send + Sync {
    fn bucket(&self, request: &ClientRequest) -> Option<BucketKey>;
}

/// Groups requests by matching an extracted field against a pattern list.
pub struct RegexBucketing {
    patterns: Vec<Regex>,
    extract: fn(&ClientRequest) -> Option<&str>,
    make_key: fn(String) -> BucketKey,
}

impl RegexBucketing {
    /// Matches the `query` request parameter.
    pub fn over_query(patterns: Vec<Regex>) -> Self {
        Self {
            patterns,
            extract: |request| request.param("query"),
            make_key: BucketKey::QueryPattern,
        }
    }

    /// Matches the `User-Agent` header.
    pub fn over_user_agent(patterns: Vec<Regex>) -> Self {
        Self {
            patterns,
            extract: |request| request.user_agent(),
            make_key: BucketKey::AgentPattern,
        }
    }
}

impl Bucketing for RegexBucketing {
    fn bucket(&self, request: &ClientRequest) -> Option<BucketKey> {
        let field = (self.extract)(request)?;
        self.patterns
            .iter()
            .find(|pattern| pattern.is_match(field))
            .map(|pattern| (self.make_key)(pattern.as_str().to_string()))
    }
}

/// The fallback segmentation by (IP, User-Agent). Never declines.
pub struct UserAgentIpBucketing;

impl UserAgentIpBucketing {
    pub fn key(&self, request: &ClientRequest) -> BucketKey {
        BucketKey::Client {
            ip: request.ip(),
            agent: request.user_agent().unwrap_or("").to_string(),
        }
    }
}

impl Bucketing for UserAgentIpBucketing {
    fn bucket(&self, request: &ClientRequest) -> Option<BucketKey> {
        Some(self.key(request))
    }
}

/// Loads a pattern file: UTF-8, one regex per line. A missing path or an
/// unreadable file degrades to an empty list; individual lines that fail to
/// compile are skipped with a warning.
pub fn load_patterns(path: Option<&Path>) -> Vec<Regex> {
    let Some(path) = path else {
        return Vec::new();
    };
    if !path.exists() {
        info!("Patterns file {} not found, ignoring.", path.display());
        return Vec::new();
    }
    match fs::read_to_string(path) {
        Ok(text) => {
            let patterns = compile_patterns(text.lines());
            info!("Loaded {} patterns from {}", patterns.len(), path.display());
            patterns
        }
        Err(err) => {
            warn!("Failed reading from patterns file {}: {}", path.display(), err);
            Vec::new()
        }
    }
}

fn compile_patterns<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Regex> {
    lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(safe_compile)
        .collect()
}

/// Compiles one pattern in DOTALL mode, logging and dropping invalid input.
fn safe_compile(line: &str) -> Option<Regex> {
    match RegexBuilder::new(line).dot_matches_new_line(true).build() {
        Ok(pattern) => Some(pattern),
        Err(_) => {
            warn!("Invalid pattern: {}", line);
            None
        }
    }
}
