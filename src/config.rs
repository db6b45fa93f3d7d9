//! Configuration loading.
//!
//! The proxy is driven by a single TOML file naming the listening ports,
//! the virtual-host targets with their backend endpoints, and the
//! access-log destination:
//!
//! ```toml
//! access_log = "/var/log/backhaul/access.log"
//!
//! [[listener]]
//! port = 8080
//!
//! [[listener]]
//! port = 8443
//! tls_cert = "/etc/backhaul/cert.pem"
//! tls_key = "/etc/backhaul/key.pem"
//!
//! [[target]]
//! hosts = ["www.example.com", "example.com"]
//! backends = ["10.0.0.1:8081", "http://10.0.0.2:8081"]
//!
//! [target.access]
//! allow = ["10.0.0.0/8"]
//! deny = ["0.0.0.0/0"]
//! redirect = "https://blocked.example.com/"
//! ```
//!
//! The file is read once at startup; everything built from it (router,
//! pools, listeners) is immutable for the life of the process.

use std::{fs, path::Path, path::PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the access-log file. Records go to stderr when absent.
    #[serde(default)]
    pub access_log: Option<PathBuf>,

    /// Listening ports. At least one is required.
    #[serde(rename = "listener")]
    pub listeners: Vec<Listener>,

    /// Virtual-host targets.
    #[serde(rename = "target", default)]
    pub targets: Vec<Target>,
}

/// One listening port, optionally with TLS material.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listener {
    /// TCP port to bind on all interfaces.
    pub port: u16,

    /// PEM certificate chain path; enables TLS together with `tls_key`.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private-key path; enables TLS together with `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl Listener {
    /// Whether this listener terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_cert.is_some()
    }
}

/// One virtual-host target: the Host values it serves and the ordered
/// backends requests are balanced across.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// Host header values routed to this target, matched with and without
    /// a `:port` suffix.
    pub hosts: Vec<String>,

    /// Ordered backend endpoints, `host:port` pairs or `http://` URLs.
    ///
    /// May be empty; requests for the target then answer 503 until the
    /// configuration grows backends.
    #[serde(default)]
    pub backends: Vec<String>,

    /// Optional network access-control policy for this target.
    #[serde(default)]
    pub access: Option<AccessPolicy>,
}

/// Network access-control policy: the request's client address must match
/// an `allow` entry before any `deny` entry matches it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessPolicy {
    /// CIDR blocks allowed through, checked first.
    #[serde(default)]
    pub allow: Vec<String>,

    /// CIDR blocks rejected.
    #[serde(default)]
    pub deny: Vec<String>,

    /// Where rejected clients are redirected. Without it they receive a
    /// 403 page.
    #[serde(default)]
    pub redirect: Option<String>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let raw = fs::read_to_string(path.as_ref()).map_err(Error::config)?;
        Config::parse(&raw)
    }

    /// Parses and validates configuration text.
    pub fn parse(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw).map_err(Error::config)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::config("at least one [[listener]] is required"));
        }

        for listener in &self.listeners {
            if listener.tls_cert.is_some() != listener.tls_key.is_some() {
                return Err(Error::config(format!(
                    "listener {}: tls_cert and tls_key must be set together",
                    listener.port
                )));
            }
        }

        for target in &self.targets {
            if target.hosts.is_empty() {
                return Err(Error::config("every [[target]] needs at least one host"));
            }
            for backend in &target.backends {
                // Fail fast on unparseable endpoints instead of at dial time.
                crate::backend::Destination::parse(backend)?;
            }
        }

        Ok(())
    }
}
