//! Network address specs: `tcp/<port>` or `tcp/<host>:<port>`.
//!
//! A spec that fails to parse is still a value: it remembers the original
//! text and every connect or listen against it fails immediately.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Spec {
    host: String,
    port: u16,
    malformed: Option<String>,
}

impl Spec {
    pub fn parse(text: &str) -> Spec {
        Self::try_parse(text).unwrap_or_else(|| Spec {
            host: String::new(),
            port: 0,
            malformed: Some(text.to_string()),
        })
    }

    fn try_parse(text: &str) -> Option<Spec> {
        let rest = text.strip_prefix("tcp/")?;
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (host, port),
            Some(_) => return None,
            None => ("", rest),
        };
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Some(Spec {
            host: host.to_string(),
            port: port.parse().ok()?,
            malformed: None,
        })
    }

    /// Port-only spec, e.g. for listening on every interface.
    pub fn from_port(port: u16) -> Spec {
        Spec {
            host: String::new(),
            port,
            malformed: None,
        }
    }

    pub fn from_host_port(host: impl Into<String>, port: u16) -> Spec {
        Spec {
            host: host.into(),
            port,
            malformed: None,
        }
    }

    pub fn malformed(&self) -> bool {
        self.malformed.is_some()
    }

    /// `Err(MalformedSpec)` for a spec that did not parse.
    pub fn check(&self) -> Result<()> {
        match &self.malformed {
            Some(raw) => Err(ProtocolError::MalformedSpec(raw.clone())),
            None => Ok(()),
        }
    }

    pub fn host(&self) -> Option<&str> {
        (!self.host.is_empty()).then_some(self.host.as_str())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host to connect to; port-only specs mean the local machine.
    pub fn connect_host(&self) -> &str {
        self.host().unwrap_or("localhost")
    }

    /// `host:port` string suitable for resolving and connecting.
    pub fn connect_address(&self) -> String {
        join_host_port(self.connect_host(), self.port)
    }

    /// `host:port` string for binding; port-only specs bind every interface.
    pub fn listen_address(&self) -> String {
        join_host_port(self.host().unwrap_or("0.0.0.0"), self.port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl FromStr for Spec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let spec = Spec::parse(s);
        spec.check()?;
        Ok(spec)
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.malformed, self.host()) {
            (Some(raw), _) => write!(f, "{raw}"),
            (None, Some(host)) if host.contains(':') => write!(f, "tcp/[{host}]:{}", self.port),
            (None, Some(host)) => write!(f, "tcp/{host}:{}", self.port),
            (None, None) => write!(f, "tcp/{}", self.port),
        }
    }
}
