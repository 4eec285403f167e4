//! Dotted version numbers as printed by package managers.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Text after `-`, e.g. `beta.2`.
    pub pre: Option<String>,
}

impl Version {
    /// Accepts `1.2.3`, `v1.2.3`, `1.2` and `1.2.3-rc.1`. Build metadata after
    /// `+` is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.strip_prefix('v').unwrap_or(text);
        let text = text.split('+').next().unwrap_or(text);
        let (core, pre) = match text.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (text, None),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Ok(0), str::parse).ok()?;
        let patch = parts.next().map_or(Ok(0), str::parse).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Same numeric triple and pre-release tag.
    pub fn same_release(&self, other: &Version) -> bool {
        self.cmp_release(other) == Ordering::Equal && self.pre == other.pre
    }

    fn cmp_release(&self, other: &Version) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// Whether `latest` should replace `installed`. Pre-releases never do.
pub fn is_newer(latest: &Version, installed: &Version) -> bool {
    !latest.is_prerelease() && latest.cmp_release(installed) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    #[test]
    fn parses_common_forms() {
        assert_eq!(
            v("v2.10.3"),
            Version {
                major: 2,
                minor: 10,
                patch: 3,
                pre: None
            }
        );
        assert_eq!(v("1.4").to_string(), "1.4.0");
        assert_eq!(v(" 3.0.0-beta.2\n").pre.as_deref(), Some("beta.2"));
        assert_eq!(v("1.2.3+build.7").to_string(), "1.2.3");
    }

    #[test]
    fn rejects_garbage() {
        for text in ["", "latest", "1.x.0", "1.2.3.4", "1.2.3-"] {
            assert_eq!(Version::parse(text), None, "{text}");
        }
    }

    #[test]
    fn comparison_is_numeric() {
        assert!(is_newer(&v("1.10.0"), &v("1.9.9")));
        assert!(is_newer(&v("2.0.0"), &v("1.99.99")));
        assert!(!is_newer(&v("1.2.3"), &v("1.2.3")));
        assert!(!is_newer(&v("1.2.2"), &v("1.2.3")));
    }

    #[test]
    fn prerelease_is_never_newer() {
        assert!(!is_newer(&v("2.0.0-rc.1"), &v("1.0.0")));
        assert!(!is_newer(&v("1.0.1"), &v("1.0.1-rc.1")));
        assert!(v("1.0.0").same_release(&v("v1.0.0")));
        assert!(!v("1.0.0").same_release(&v("1.0.0-rc.1")));
    }
}
