//! Mount-option model.
//!
//! Options arrive as `-o name[=value]` strings, comma-separated groups
//! allowed, in the style every FUSE daemon inherits from `mount(8)`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Kernel caching posture. Selects both the default attribute/entry
/// timeout and the per-open caching flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Never,
    Auto,
    Always,
}

impl CachePolicy {
    pub fn default_timeout(self) -> f64 {
        match self {
            CachePolicy::Never => 0.0,
            CachePolicy::Auto => 1.0,
            CachePolicy::Always => 86400.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountOpts {
    /// Shadow-tree root (`source=` / `shadow=`). Required.
    pub source: Option<PathBuf>,
    /// Backing DAX device name; enables the DAX capability.
    pub daxdev: Option<String>,
    pub writeback: bool,
    pub flock: bool,
    /// Diagnostic mode: export the raw shadow documents as the files.
    pub pass_yaml: bool,
    pub readdirplus: bool,
    pub cache: CachePolicy,
    /// Attribute/entry validity timeout in seconds. Resolved from `cache`
    /// in [`MountOpts::finalize`] unless given explicitly.
    pub timeout: f64,
    pub timeout_set: bool,
    pub debug: u32,
}

impl Default for MountOpts {
    fn default() -> Self {
        MountOpts {
            source: None,
            daxdev: None,
            writeback: false,
            flock: true,
            pass_yaml: false,
            readdirplus: true,
            cache: CachePolicy::Auto,
            timeout: 0.0,
            timeout_set: false,
            debug: 0,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum OptError {
    Unknown(String),
    BadValue { opt: String, value: String },
    MissingSource,
    NegativeTimeout(f64),
}

impl fmt::Display for OptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptError::Unknown(opt) => write!(f, "unknown mount option {opt:?}"),
            OptError::BadValue { opt, value } => {
                write!(f, "bad value {value:?} for mount option {opt:?}")
            }
            OptError::MissingSource => {
                write!(f, "missing shadow tree path; pass -o source=/shadow/path")
            }
            OptError::NegativeTimeout(t) => write!(f, "timeout is negative ({t})"),
        }
    }
}

impl std::error::Error for OptError {}

impl MountOpts {
    /// Parse a list of `-o` arguments (each possibly comma-separated) and
    /// resolve defaults.
    pub fn parse<I, S>(items: I) -> Result<MountOpts, OptError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = MountOpts::default();
        for item in items {
            for token in item.as_ref().split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    opts.apply(token)?;
                }
            }
        }
        opts.finalize()
    }

    fn apply(&mut self, token: &str) -> Result<(), OptError> {
        let (name, value) = match token.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (token, None),
        };

        match (name, value) {
            ("source" | "shadow", Some(v)) => self.source = Some(PathBuf::from(v)),
            ("daxdev", Some(v)) => self.daxdev = Some(v.to_owned()),
            ("writeback", None) => self.writeback = true,
            ("no_writeback", None) => self.writeback = false,
            ("flock", None) => self.flock = true,
            ("no_flock", None) => self.flock = false,
            ("pass_yaml", None) => self.pass_yaml = true,
            ("readdirplus", None) => self.readdirplus = true,
            ("no_readdirplus", None) => self.readdirplus = false,
            ("cache", Some("never")) => self.cache = CachePolicy::Never,
            ("cache", Some("auto")) => self.cache = CachePolicy::Auto,
            ("cache", Some("always")) => self.cache = CachePolicy::Always,
            ("timeout", Some(v)) => {
                self.timeout = v.parse::<f64>().map_err(|_| OptError::BadValue {
                    opt: name.to_owned(),
                    value: v.to_owned(),
                })?;
                self.timeout_set = true;
            }
            ("debug", Some(v)) => {
                self.debug = v.parse::<u32>().map_err(|_| OptError::BadValue {
                    opt: name.to_owned(),
                    value: v.to_owned(),
                })?;
            }
            _ => return Err(OptError::Unknown(token.to_owned())),
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<MountOpts, OptError> {
        if self.source.is_none() {
            return Err(OptError::MissingSource);
        }
        if !self.timeout_set {
            self.timeout = self.cache.default_timeout();
        } else if self.timeout < 0.0 {
            return Err(OptError::NegativeTimeout(self.timeout));
        }
        Ok(self)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_and_shadow_are_aliases() {
        let a = MountOpts::parse(["source=/tmp/s"]).unwrap();
        let b = MountOpts::parse(["shadow=/tmp/s"]).unwrap();
        assert_eq!(a.source, b.source);
        assert_eq!(a.source.unwrap(), PathBuf::from("/tmp/s"));
    }

    #[test]
    fn defaults() {
        let opts = MountOpts::parse(["source=/s"]).unwrap();
        assert!(!opts.writeback);
        assert!(opts.flock);
        assert!(opts.readdirplus);
        assert!(!opts.pass_yaml);
        assert_eq!(opts.cache, CachePolicy::Auto);
        assert_eq!(opts.timeout, 1.0);
        assert!(opts.daxdev.is_none());
    }

    #[test]
    fn comma_separated_group() {
        let opts =
            MountOpts::parse(["source=/s,daxdev=/dev/dax0.0,writeback", "no_flock"]).unwrap();
        assert!(opts.writeback);
        assert!(!opts.flock);
        assert_eq!(opts.daxdev.as_deref(), Some("/dev/dax0.0"));
    }

    #[test]
    fn cache_policy_selects_default_timeout() {
        let never = MountOpts::parse(["source=/s", "cache=never"]).unwrap();
        assert_eq!(never.timeout, 0.0);
        let auto = MountOpts::parse(["source=/s", "cache=auto"]).unwrap();
        assert_eq!(auto.timeout, 1.0);
        let always = MountOpts::parse(["source=/s", "cache=always"]).unwrap();
        assert_eq!(always.timeout, 86400.0);
    }

    #[test]
    fn explicit_timeout_wins_over_cache_policy() {
        let opts = MountOpts::parse(["source=/s", "cache=always", "timeout=2.5"]).unwrap();
        assert!(opts.timeout_set);
        assert_eq!(opts.timeout, 2.5);
    }

    #[test]
    fn negative_timeout_is_rejected() {
        assert_eq!(
            MountOpts::parse(["source=/s", "timeout=-1"]).unwrap_err(),
            OptError::NegativeTimeout(-1.0)
        );
    }

    #[test]
    fn missing_source_is_rejected() {
        assert_eq!(
            MountOpts::parse(["flock"]).unwrap_err(),
            OptError::MissingSource
        );
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(matches!(
            MountOpts::parse(["source=/s", "sparkle"]),
            Err(OptError::Unknown(_))
        ));
        assert!(matches!(
            MountOpts::parse(["source=/s", "cache=sometimes"]),
            Err(OptError::Unknown(_))
        ));
    }

    #[test]
    fn bad_numeric_values_are_rejected() {
        assert!(matches!(
            MountOpts::parse(["source=/s", "timeout=fast"]),
            Err(OptError::BadValue { .. })
        ));
        assert!(matches!(
            MountOpts::parse(["source=/s", "debug=very"]),
            Err(OptError::BadValue { .. })
        ));
    }
}
