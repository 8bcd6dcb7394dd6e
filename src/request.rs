//! The per-request fingerprint the engine takes its decisions from.

use std::collections::HashMap;
use std::net::IpAddr;

use axum::http::HeaderMap;

/// Everything the classification and throttling code reads from a request:
/// source IP, `User-Agent`, query parameters, and header presence. Built once
/// per request from the HTTP layer so the decision code stays plain data in,
/// plain data out.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    ip: IpAddr,
    user_agent: Option<String>,
    params: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl ClientRequest {
    pub fn from_http(ip: IpAddr, headers: &HeaderMap, query: Option<&str>) -> Self {
        let headers: HashMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        let params = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            ip,
            user_agent: headers.get("user-agent").cloned(),
            params,
            headers,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// First value of the named query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }
}
