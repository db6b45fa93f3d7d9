//! Network access control.
//!
//! Each target may carry an allow/deny policy over client addresses,
//! evaluated before the request body is touched. The policy is the
//! pre-dispatch filter seam: a rejection fully renders the client's
//! response (a redirect when one is configured, an error page otherwise)
//! and the dispatcher never sees the request again.

use std::fmt;
use std::net::IpAddr;

use http::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use http::{Response, StatusCode};

use crate::config::AccessPolicy;
use crate::dispatch::{full_body, ProxyBody};
use crate::error::{Error, Result};

use ipnet::IpNet;

const REJECT_PAGE: &str = "<html><head><title>Access denied</title></head>\
     <body><h1>Access denied</h1>\
     <p>Your network is not permitted to use this service.</p></body></html>";

/// Pre-dispatch client filter for one target.
///
/// A client passes when its address matches an `allow` network, or when
/// it matches no `deny` network. Allow entries are checked first so a
/// narrow allowance can punch through a broad denial
/// (`allow = ["10.0.0.0/8"]`, `deny = ["0.0.0.0/0"]`).
pub struct AccessControl {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    redirect: Option<String>,
}

/// What the filter decided about a request.
#[derive(Debug)]
pub enum Verdict {
    /// The request proceeds to dispatch.
    Pass,
    /// The request ends here; the response is fully rendered.
    Reject(Response<ProxyBody>),
}

impl AccessControl {
    /// A filter that passes every client; used for targets without a
    /// policy.
    pub fn allow_all() -> AccessControl {
        AccessControl {
            allow: Vec::new(),
            deny: Vec::new(),
            redirect: None,
        }
    }

    /// Builds the filter from a configured policy.
    pub fn from_policy(policy: &AccessPolicy) -> Result<AccessControl> {
        Ok(AccessControl {
            allow: parse_nets(&policy.allow)?,
            deny: parse_nets(&policy.deny)?,
            redirect: policy.redirect.clone(),
        })
    }

    /// Evaluates a client address against the policy.
    pub fn evaluate(&self, remote: IpAddr) -> Verdict {
        if self.allow.iter().any(|net| net.contains(&remote)) {
            return Verdict::Pass;
        }
        if self.deny.iter().any(|net| net.contains(&remote)) {
            return Verdict::Reject(self.render());
        }
        Verdict::Pass
    }

    fn render(&self) -> Response<ProxyBody> {
        let builder = match &self.redirect {
            Some(location) => {
                let location = HeaderValue::from_str(location)
                    .unwrap_or_else(|_| HeaderValue::from_static("/"));
                Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, location)
            }
            None => Response::builder().status(StatusCode::FORBIDDEN),
        };
        builder
            .header(CONTENT_TYPE, HeaderValue::from_static("text/html"))
            .body(full_body(REJECT_PAGE))
            .unwrap_or_else(|_| Response::new(full_body(REJECT_PAGE)))
    }
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccessControl")
            .field("allow", &self.allow)
            .field("deny", &self.deny)
            .field("redirect", &self.redirect)
            .finish()
    }
}

fn parse_nets(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| Error::config(format!("invalid network in access policy: {entry}")))
        })
        .collect()
}
