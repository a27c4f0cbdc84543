//! Caller identity derivation.
//!
//! Every rate limit is tracked against an [`Identity`], derived from whatever
//! the request pipeline knows about the caller. Resolution never fails: a
//! request with no usable hints maps to [`Identity::unknown`].

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Opaque caller key: `user:<id>`, `ip:<address>` or `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    const UNKNOWN: &'static str = "unknown";

    /// Identity of an authenticated principal.
    pub fn user(id: impl AsRef<str>) -> Self {
        Self(format!("user:{}", id.as_ref()))
    }

    /// Identity of a network origin.
    pub fn ip(addr: impl fmt::Display) -> Self {
        Self(format!("ip:{}", addr))
    }

    /// Sentinel identity for callers with no usable hints.
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Check whether this is the sentinel identity.
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the request pipeline knows about an inbound request.
///
/// Header names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Identifier of the authenticated principal
    pub principal_id: Option<String>,
    /// Alternate identifier declared by the caller (e.g. a `user_id` field)
    pub user_id: Option<String>,
    /// Address of the connecting peer
    pub peer_addr: Option<IpAddr>,
    /// Request path
    pub path: String,
    /// Request headers, keyed by lowercased name
    pub headers: HashMap<String, String>,
    /// Subscription tier attached to the caller, if known
    pub subscription_tier: Option<String>,
}

impl RequestContext {
    /// Create a context for a request path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the authenticated principal.
    pub fn with_principal(mut self, id: impl Into<String>) -> Self {
        self.principal_id = Some(id.into());
        self
    }

    /// Set the alternate user identifier.
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Set the peer address.
    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the subscription tier.
    pub fn with_subscription_tier(mut self, tier: impl Into<String>) -> Self {
        self.subscription_tier = Some(tier.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Derives the caller key from a request context.
///
/// Preference order: authenticated principal, declared user id, network
/// origin, then `unknown`. When a trusted forwarding header is configured,
/// its first hop is used as the network origin in preference to the peer
/// address.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trusted_forwarded_header: Option<String>,
}

impl IdentityResolver {
    /// Create a resolver that only trusts the peer address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the first hop of the given header (e.g. `x-forwarded-for`).
    pub fn with_trusted_forwarded_header(mut self, header: impl AsRef<str>) -> Self {
        self.trusted_forwarded_header = Some(header.as_ref().to_ascii_lowercase());
        self
    }

    /// Resolve the identity of a request.
    pub fn resolve(&self, ctx: &RequestContext) -> Identity {
        if let Some(id) = non_blank(ctx.principal_id.as_deref()) {
            return Identity::user(id);
        }
        if let Some(id) = non_blank(ctx.user_id.as_deref()) {
            return Identity::user(id);
        }
        if let Some(addr) = self.forwarded_origin(ctx) {
            return Identity::ip(addr);
        }
        match ctx.peer_addr {
            Some(addr) => Identity::ip(canonical(addr)),
            None => Identity::unknown(),
        }
    }

    fn forwarded_origin(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let header = self.trusted_forwarded_header.as_deref()?;
        let first_hop = ctx.header(header)?.split(',').next()?.trim();
        first_hop.parse::<IpAddr>().ok().map(canonical)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// IPv4-mapped IPv6 addresses collapse to their IPv4 form so the same caller
/// maps to the same key on dual-stack listeners.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
