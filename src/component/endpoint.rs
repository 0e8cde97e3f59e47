//! Server endpoint parsing.
//!
//! Used for `see-other-host` redirect targets and for the `--server` command-line
//! override. Accepts `host`, `host:port`, `[v6]`, `[v6]:port`, a bare IPv6 literal, and
//! an optional `tcp://` scheme.

use std::fmt;

/// Host and port of the XMPP server's component listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    /// `host:port`, bracketing IPv6 literals, suitable for `TcpStream::connect`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `input`, keeping `default_port` when none is given. Returns `None` for an
/// empty host or an unparsable port.
pub fn parse_endpoint(input: &str, default_port: u16) -> Option<Endpoint> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');

    // [v6] or [v6]:port
    if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match after.strip_prefix(':') {
            Some(port_str) => port_str.parse::<u16>().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(Endpoint::new(host, port));
    }

    // More than one colon without brackets: a bare IPv6 literal.
    if trimmed.matches(':').count() > 1 {
        return Some(Endpoint::new(trimmed, default_port));
    }

    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if host.is_empty() {
            return None;
        }
        let port = port_str.parse::<u16>().ok()?;
        return Some(Endpoint::new(host, port));
    }

    if trimmed.is_empty() {
        return None;
    }
    Some(Endpoint::new(trimmed, default_port))
}
