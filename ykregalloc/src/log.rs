//! The implementation of the `YKRA_LOG` environment variable and of the allocator's trace output.

use crate::errors::RegAllocError;
use std::{env, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

/// How verbose should the allocator's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log every decision the register allocator makes.
    RegAlloc,
}

#[derive(Debug)]
pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Create a [Log] from the `YKRA_LOG` environment variable.
    pub fn from_env() -> Result<Self, RegAllocError> {
        Self::from_config(env::var("YKRA_LOG").ok().as_deref())
    }

    /// Create a [Log] from a string of the form `[<path>|-:]<level>`. `None` gives a log which
    /// reports errors to stderr.
    pub fn from_config(config: Option<&str>) -> Result<Self, RegAllocError> {
        let Some(s) = config else {
            return Ok(Self {
                path: None,
                level: Verbosity::Error,
            });
        };
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log file so that later appends don't mix with a
                    // previous run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => {
                return Err(RegAllocError::LogConfig(
                    "YKRA_LOG must be of the format `[<path|->:]<level>`".into(),
                ))
            }
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| RegAllocError::LogConfig(format!("Invalid level '{s}': {e}")))?;
        // This unwrap can only fail if the types are wrong statically.
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level).ok_or_else(|| {
            RegAllocError::LogConfig(format!("Level {level} exceeds maximum {max_level}"))
        })?;
        Ok(Self { path, level })
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "ykra-error",
                Verbosity::Warning => "ykra-warning",
                Verbosity::RegAlloc => "ykra-regalloc",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

/// Somewhere the register allocator can write its trace to. Each call receives one line without
/// a trailing newline.
pub trait TraceSink {
    fn trace(&mut self, line: &str);
}

impl TraceSink for Log {
    fn trace(&mut self, line: &str) {
        self.log(Verbosity::RegAlloc, line);
    }
}

/// Collect the trace in memory.
impl TraceSink for String {
    fn trace(&mut self, line: &str) {
        self.push_str(line);
        self.push('\n');
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config() {
        assert_eq!(Log::from_config(None).unwrap().level(), Verbosity::Error);
        assert_eq!(Log::from_config(Some("0")).unwrap().level(), Verbosity::Disabled);
        let l = Log::from_config(Some("-:3")).unwrap();
        assert_eq!(l.level(), Verbosity::RegAlloc);
        assert!(l.path.is_none());
        assert!(matches!(
            Log::from_config(Some("4")),
            Err(RegAllocError::LogConfig(_))
        ));
        assert!(matches!(
            Log::from_config(Some("x")),
            Err(RegAllocError::LogConfig(_))
        ));
        assert!(matches!(
            Log::from_config(Some("a:b:1")),
            Err(RegAllocError::LogConfig(_))
        ));
    }

    #[test]
    fn string_sink() {
        let mut s = String::new();
        s.trace("a");
        s.trace("b c");
        assert_eq!(s, "a\nb c\n");
    }
}
