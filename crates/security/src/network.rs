//! Bind-address and outbound-destination policy.

use std::net::IpAddr;

use {ipnet::IpNet, tracing::warn};

use crate::error::{Result, SecurityError};

/// Outcome of an egress check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDecision {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EgressRule {
    Host(String),
    Suffix(String),
    Ip(IpAddr),
    Cidr(IpNet),
}

impl EgressRule {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return None;
        }
        if let Some(suffix) = entry.strip_prefix("*.") {
            return Some(Self::Suffix(suffix.to_string()));
        }
        if entry.contains('/') {
            return entry.parse().ok().map(Self::Cidr);
        }
        if let Ok(ip) = entry.trim_matches(['[', ']']).parse() {
            return Some(Self::Ip(ip));
        }
        Some(Self::Host(entry))
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Self::Host(h) => h == host,
            Self::Suffix(suffix) => {
                host == suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            },
            Self::Ip(allowed) => ip == Some(*allowed),
            Self::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
        }
    }
}

/// Default-deny egress allowlist plus the public-bind switch.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    rules: Vec<EgressRule>,
    allow_public_bind: bool,
}

impl NetworkPolicy {
    /// Build from allowlist entries. Unparseable entries are logged and
    /// skipped; they never widen the policy.
    #[must_use]
    pub fn new(egress_allowlist: &[String], allow_public_bind: bool) -> Self {
        let rules = egress_allowlist
            .iter()
            .filter_map(|entry| {
                let rule = EgressRule::parse(entry);
                if rule.is_none() {
                    warn!(entry = %entry, "ignoring invalid egress allowlist entry");
                }
                rule
            })
            .collect();
        Self {
            rules,
            allow_public_bind,
        }
    }

    /// Decide whether `host` may be contacted.
    #[must_use]
    pub fn check_egress(&self, host: &str) -> NetworkDecision {
        let host = host.trim().trim_matches(['[', ']']).to_ascii_lowercase();
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return NetworkDecision::Denied;
        }
        let ip = host.parse::<IpAddr>().ok();
        if self.rules.iter().any(|rule| rule.matches(host, ip)) {
            NetworkDecision::Allowed
        } else {
            NetworkDecision::Denied
        }
    }

    /// Check the host of a URL. URLs without a host are denied.
    #[must_use]
    pub fn check_url(&self, raw: &str) -> NetworkDecision {
        match url::Url::parse(raw).ok().and_then(|u| u.host_str().map(str::to_string)) {
            Some(host) => self.check_egress(&host),
            None => NetworkDecision::Denied,
        }
    }

    /// Loopback hosts are always bindable; anything else needs
    /// `allow_public_bind`.
    pub fn check_bind(&self, host: &str) -> Result<()> {
        if is_loopback(host) || self.allow_public_bind {
            Ok(())
        } else {
            Err(SecurityError::PublicBindDenied {
                host: host.to_string(),
            })
        }
    }
}

/// Whether `host` names a loopback interface.
#[must_use]
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim().trim_matches(['[', ']']);
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| match ip {
                IpAddr::V4(v4) => v4.is_loopback(),
                IpAddr::V6(v6) => {
                    v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
                },
            })
            .unwrap_or(false)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn policy() -> NetworkPolicy {
        NetworkPolicy::new(
            &[
                "api.example.com".into(),
                "*.internal.test".into(),
                "192.0.2.7".into(),
                "10.1.0.0/16".into(),
                "bogus/cidr".into(),
            ],
            false,
        )
    }

    #[rstest]
    #[case("api.example.com", NetworkDecision::Allowed)]
    #[case("API.Example.com.", NetworkDecision::Allowed)]
    #[case("other.example.com", NetworkDecision::Denied)]
    #[case("svc.internal.test", NetworkDecision::Allowed)]
    #[case("internal.test", NetworkDecision::Allowed)]
    #[case("evilinternal.test", NetworkDecision::Denied)]
    #[case("192.0.2.7", NetworkDecision::Allowed)]
    #[case("192.0.2.8", NetworkDecision::Denied)]
    #[case("10.1.200.3", NetworkDecision::Allowed)]
    #[case("10.2.0.1", NetworkDecision::Denied)]
    #[case("", NetworkDecision::Denied)]
    fn egress_cases(#[case] host: &str, #[case] expected: NetworkDecision) {
        assert_eq!(policy().check_egress(host), expected);
    }

    #[test]
    fn empty_allowlist_denies_everything() {
        let p = NetworkPolicy::default();
        assert_eq!(p.check_egress("localhost"), NetworkDecision::Denied);
        assert_eq!(p.check_url("https://example.com/x"), NetworkDecision::Denied);
    }

    #[test]
    fn url_host_is_checked() {
        assert_eq!(
            policy().check_url("https://api.example.com:8443/v1"),
            NetworkDecision::Allowed
        );
        assert_eq!(policy().check_url("not a url"), NetworkDecision::Denied);
    }

    #[rstest]
    #[case("127.0.0.1", true)]
    #[case("127.8.9.10", true)]
    #[case("::1", true)]
    #[case("[::1]", true)]
    #[case("::ffff:127.0.0.1", true)]
    #[case("localhost", true)]
    #[case("0.0.0.0", false)]
    #[case("192.168.1.10", false)]
    fn loopback_detection(#[case] host: &str, #[case] expected: bool) {
        assert_eq!(is_loopback(host), expected);
    }

    #[test]
    fn public_bind_requires_flag() {
        let closed = NetworkPolicy::new(&[], false);
        assert!(closed.check_bind("127.0.0.1").is_ok());
        assert!(matches!(
            closed.check_bind("0.0.0.0"),
            Err(SecurityError::PublicBindDenied { .. })
        ));

        let open = NetworkPolicy::new(&[], true);
        assert!(open.check_bind("0.0.0.0").is_ok());
    }
}
