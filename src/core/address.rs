//! Client→server address pairs

use crate::core::error::AlgebraError;
use crate::core::rule::{Family, Rule};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A route is always described from the client's side: `src` is the client,
/// `dst` the server. Either side may be left open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RouteSpec", into = "RouteSpec")]
pub struct Route {
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<IpAddr>,
}

impl Route {
    /// # Errors
    ///
    /// [`AlgebraError::TypeMismatch`] when `src` and `dst` are of different families.
    pub fn new(src: Option<IpAddr>, dst: Option<IpAddr>) -> Result<Self, AlgebraError> {
        if let (Some(s), Some(d)) = (src, dst) {
            let (expected, found) = (Family::of_addr(&s), Family::of_addr(&d));
            if expected != found {
                return Err(AlgebraError::TypeMismatch { expected, found });
            }
        }
        Ok(Self { src, dst })
    }

    pub fn src(&self) -> Option<IpAddr> {
        self.src
    }

    pub fn dst(&self) -> Option<IpAddr> {
        self.dst
    }

    pub fn family(&self) -> Option<Family> {
        self.src.or(self.dst).map(|addr| Family::of_addr(&addr))
    }

    /// Host-scoped rule for the client→server direction.
    pub fn rule(&self) -> Rule {
        Rule {
            src: self.src.map(IpNetwork::from),
            dst: self.dst.map(IpNetwork::from),
            ..Rule::default()
        }
    }
}

impl TryFrom<RouteSpec> for Route {
    type Error = AlgebraError;

    fn try_from(spec: RouteSpec) -> Result<Self, Self::Error> {
        Route::new(spec.src, spec.dst)
    }
}

impl From<Route> for RouteSpec {
    fn from(route: Route) -> Self {
        RouteSpec {
            src: route.src,
            dst: route.dst,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |addr: Option<IpAddr>| addr.map_or_else(|| "any".to_string(), |a| a.to_string());
        write!(f, "{} -> {}", side(self.src), side(self.dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_route_family_check() {
        assert!(Route::new(ip("192.168.1.10"), ip("192.168.1.1")).is_ok());
        assert_eq!(
            Route::new(ip("192.168.1.10"), ip("fe80::1")),
            Err(AlgebraError::TypeMismatch {
                expected: Family::Ipv4,
                found: Family::Ipv6,
            })
        );
    }

    #[test]
    fn test_route_rule_is_host_scoped() {
        let route = Route::new(ip("192.168.1.10"), ip("192.168.1.1")).unwrap();
        let rule = route.rule();
        assert_eq!(rule.src, Some("192.168.1.10/32".parse().unwrap()));
        assert_eq!(rule.dst, Some("192.168.1.1/32".parse().unwrap()));
        assert_eq!(rule.address_family().unwrap(), Some(Family::Ipv4));
    }

    #[test]
    fn test_route_display() {
        let route = Route::new(ip("10.0.0.1"), None).unwrap();
        assert_eq!(route.to_string(), "10.0.0.1 -> any");
    }

    #[test]
    fn test_route_deserialize_checks_family() {
        let ok: Route = serde_json::from_str(r#"{"dst": "2001:db8::1"}"#).unwrap();
        assert_eq!(ok.family(), Some(Family::Ipv6));

        let mixed = serde_json::from_str::<Route>(r#"{"src": "10.0.0.1", "dst": "::1"}"#);
        assert!(mixed.is_err());
    }
}
