//! Semantic version parsing and client/daemon compatibility rules
//!
//! The daemon and its proxy clients may be built from different releases.
//! The handshake uses these rules to decide whether a client may attach and
//! which side should upgrade.

use std::cmp::Ordering;

use crate::error::IpcError;

/// Longest version string we will attempt to parse
const MAX_VERSION_LEN: usize = 64;

/// Ceiling on numeric components; defends against garbled input
const MAX_COMPONENT: u64 = 1_000_000;

/// A parsed `major.minor.patch[-prerelease][+build]` version.
///
/// `build` is informational only and never affects ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

/// Parse a semver string; `None` for anything out of bounds or malformed
pub fn parse_version(s: &str) -> Option<ParsedVersion> {
    if s.is_empty() || s.len() > MAX_VERSION_LEN {
        return None;
    }

    let (rest, build) = match s.split_once('+') {
        Some((head, build)) if !build.is_empty() => (head, Some(build.to_string())),
        Some(_) => return None,
        None => (s, None),
    };

    let (core, prerelease) = match rest.split_once('-') {
        Some((head, pre)) if !pre.is_empty() => (head, Some(pre.to_string())),
        Some(_) => return None,
        None => (rest, None),
    };

    let mut parts = core.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = parse_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    Some(ParsedVersion {
        major,
        minor,
        patch,
        prerelease,
        build,
    })
}

fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = s.parse().ok()?;
    (n <= MAX_COMPONENT).then_some(n)
}

/// Order two parsed versions: major, then minor, then patch, then
/// prerelease. A version without a prerelease sorts higher than the same
/// version with one. Build metadata is ignored.
pub fn compare_versions(a: &ParsedVersion, b: &ParsedVersion) -> Ordering {
    a.major
        .cmp(&b.major)
        .then(a.minor.cmp(&b.minor))
        .then(a.patch.cmp(&b.patch))
        .then_with(|| match (&a.prerelease, &b.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(pa), Some(pb)) => compare_prerelease(pa, pb),
        })
}

/// Dot-separated identifiers: numeric pairs compare numerically, everything
/// else lexically; fewer identifiers sort lower when the shared prefix ties.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut ia = a.split('.');
    let mut ib = b.split('.');
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Outcome of a compatibility check
#[derive(Debug, Clone, PartialEq)]
pub struct Compatibility {
    pub compatible: bool,
    /// Why the client was refused (or hinted), for the handshake reply
    pub reason: Option<String>,
    /// True when the daemon is the older side and should be upgraded
    pub upgrade_recommended: bool,
}

impl Compatibility {
    fn ok() -> Self {
        Self {
            compatible: true,
            reason: None,
            upgrade_recommended: false,
        }
    }

    fn refused(reason: String, upgrade_recommended: bool) -> Self {
        Self {
            compatible: false,
            reason: Some(reason),
            upgrade_recommended,
        }
    }
}

/// Compatibility checker bound to the running daemon's identity.
///
/// Construction rejects an unparseable base version outright; that is a
/// build problem, not a runtime condition.
#[derive(Debug, Clone)]
pub struct VersionMatcher {
    daemon: ParsedVersion,
    daemon_version: String,
    protocol_version: u32,
}

impl VersionMatcher {
    /// Create a matcher for the given daemon version and protocol number
    pub fn new(daemon_version: &str, protocol_version: u32) -> Result<Self, IpcError> {
        let daemon = parse_version(daemon_version)
            .ok_or_else(|| IpcError::InvalidVersion(daemon_version.to_string()))?;
        Ok(Self {
            daemon,
            daemon_version: daemon_version.to_string(),
            protocol_version,
        })
    }

    /// The daemon version this matcher was built with
    pub fn daemon_version(&self) -> &str {
        &self.daemon_version
    }

    /// The oldest client version this daemon accepts: `major.minor.0`
    pub fn min_client_version(&self) -> String {
        format!("{}.{}.0", self.daemon.major, self.daemon.minor)
    }

    /// Evaluate a connecting client. Rules in order, first match wins:
    /// protocol must match exactly, then major, then minor; patch may differ
    /// freely. `upgrade_recommended` is set exactly when the client is the
    /// newer side.
    pub fn check_client(&self, client_version: &str, client_protocol: u32) -> Compatibility {
        if client_protocol != self.protocol_version {
            return Compatibility::refused(
                format!(
                    "protocol version mismatch: client {} vs daemon {}",
                    client_protocol, self.protocol_version
                ),
                client_protocol > self.protocol_version,
            );
        }

        let client = match parse_version(client_version) {
            Some(v) => v,
            None => {
                return Compatibility::refused(
                    format!("unparseable client version {:?}", client_version),
                    false,
                )
            }
        };

        if client.major != self.daemon.major {
            return Compatibility::refused(
                format!(
                    "major version mismatch: client {} vs daemon {}",
                    client_version, self.daemon_version
                ),
                client.major > self.daemon.major,
            );
        }

        if client.minor != self.daemon.minor {
            let reason = if client.minor > self.daemon.minor {
                format!(
                    "client {} is newer than daemon {}; upgrade the daemon",
                    client_version, self.daemon_version
                )
            } else {
                format!(
                    "client {} is below the minimum supported version {}",
                    client_version,
                    self.min_client_version()
                )
            };
            return Compatibility::refused(reason, client.minor > self.daemon.minor);
        }

        let mut result = Compatibility::ok();
        if client.patch > self.daemon.patch {
            result.upgrade_recommended = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let v = parse_version("2.6.3").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 6, 3));
        assert_eq!(v.prerelease, None);
        assert_eq!(v.build, None);
    }

    #[test]
    fn test_parse_prerelease_and_build() {
        let v = parse_version("1.2.3-beta.2+build.99").unwrap();
        assert_eq!(v.prerelease.as_deref(), Some("beta.2"));
        assert_eq!(v.build.as_deref(), Some("build.99"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_version("").is_none());
        assert!(parse_version("1.2").is_none());
        assert!(parse_version("1.2.3.4").is_none());
        assert!(parse_version("a.b.c").is_none());
        assert!(parse_version("1.2.-3").is_none());
        assert!(parse_version("1.2.3-").is_none());
        assert!(parse_version("9999999.0.0").is_none()); // over the ceiling
        let long = format!("1.2.3-{}", "x".repeat(100));
        assert!(parse_version(&long).is_none());
    }

    fn cmp(a: &str, b: &str) -> Ordering {
        compare_versions(&parse_version(a).unwrap(), &parse_version(b).unwrap())
    }

    #[test]
    fn test_ordering() {
        assert_eq!(cmp("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(cmp("2.0.0", "1.9.9"), Ordering::Greater);
        assert_eq!(cmp("1.3.0", "1.2.9"), Ordering::Greater);
        assert_eq!(cmp("1.2.4", "1.2.3"), Ordering::Greater);
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        assert_eq!(cmp("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(cmp("1.0.0", "1.0.0-rc.1"), Ordering::Greater);
    }

    #[test]
    fn test_prerelease_identifier_ordering() {
        assert_eq!(cmp("1.0.0-alpha.2", "1.0.0-alpha.10"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(cmp("1.0.0-alpha", "1.0.0-alpha.1"), Ordering::Less);
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert_eq!(cmp("1.0.0+a", "1.0.0+b"), Ordering::Equal);
    }

    #[test]
    fn test_matcher_rejects_bad_base_version() {
        assert!(VersionMatcher::new("not-a-version", 1).is_err());
    }

    #[test]
    fn test_min_client_version() {
        let m = VersionMatcher::new("2.6.3", 1).unwrap();
        assert_eq!(m.min_client_version(), "2.6.0");
    }

    #[test]
    fn test_compat_patch_drift_recommends_daemon_upgrade() {
        let m = VersionMatcher::new("2.6.0", 1).unwrap();
        let c = m.check_client("2.6.3", 1);
        assert!(c.compatible);
        assert!(c.upgrade_recommended); // client patch 3 > daemon patch 0
    }

    #[test]
    fn test_compat_older_patch_is_quietly_fine() {
        let m = VersionMatcher::new("2.6.3", 1).unwrap();
        let c = m.check_client("2.6.0", 1);
        assert!(c.compatible);
        assert!(!c.upgrade_recommended);
    }

    #[test]
    fn test_compat_newer_client_minor() {
        let m = VersionMatcher::new("2.6.0", 1).unwrap();
        let c = m.check_client("2.7.0", 1);
        assert!(!c.compatible);
        assert!(c.upgrade_recommended);
    }

    #[test]
    fn test_compat_client_below_minimum() {
        let m = VersionMatcher::new("2.6.0", 1).unwrap();
        let c = m.check_client("2.5.9", 1);
        assert!(!c.compatible);
        assert!(!c.upgrade_recommended);
        assert!(c.reason.unwrap().contains("2.6.0"));
    }

    #[test]
    fn test_compat_protocol_mismatch_wins() {
        let m = VersionMatcher::new("2.6.0", 2).unwrap();
        let c = m.check_client("2.6.0", 1);
        assert!(!c.compatible);
        assert!(!c.upgrade_recommended);

        let c = m.check_client("2.6.0", 3);
        assert!(!c.compatible);
        assert!(c.upgrade_recommended);
    }

    #[test]
    fn test_compat_major_mismatch() {
        let m = VersionMatcher::new("2.6.0", 1).unwrap();
        assert!(!m.check_client("3.0.0", 1).compatible);
        assert!(m.check_client("3.0.0", 1).upgrade_recommended);
        assert!(!m.check_client("1.9.9", 1).upgrade_recommended);
    }
}
