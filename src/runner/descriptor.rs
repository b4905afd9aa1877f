//! Standard-stream wiring for spawned processes.
use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
};

use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use crate::error::RunnerError;

/// One of the three standard stream slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stream {
    /// Descriptor 0.
    Stdin,
    /// Descriptor 1.
    Stdout,
    /// Descriptor 2.
    Stderr,
}

impl Stream {
    /// All slots in descriptor order.
    pub const ALL: [Stream; 3] = [Stream::Stdin, Stream::Stdout, Stream::Stderr];

    /// The file descriptor number of this slot.
    pub fn index(self) -> i64 {
        match self {
            Stream::Stdin => 0,
            Stream::Stdout => 1,
            Stream::Stderr => 2,
        }
    }

    /// Direction a pipe on this slot must have, seen from the child.
    pub fn pipe_mode(self) -> PipeMode {
        match self {
            Stream::Stdin => PipeMode::Read,
            Stream::Stdout | Stream::Stderr => PipeMode::Write,
        }
    }
}

impl TryFrom<i64> for Stream {
    type Error = RunnerError;

    fn try_from(index: i64) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Stream::Stdin),
            1 => Ok(Stream::Stdout),
            2 => Ok(Stream::Stderr),
            other => Err(RunnerError::InvalidDescriptorIndex(other)),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
enum DirectiveKind {
    Pipe,
    File,
    Null,
    Inherit,
}

/// Direction of a pipe, from the child's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum PipeMode {
    /// The child reads from the pipe.
    #[strum(serialize = "r")]
    Read,
    /// The child writes to the pipe.
    #[strum(serialize = "w")]
    Write,
}

impl fmt::Display for PipeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// How a file redirection opens its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum FileMode {
    /// Open for reading.
    #[strum(serialize = "r")]
    Read,
    /// Create or truncate for writing.
    #[strum(serialize = "w")]
    Write,
    /// Create or append.
    #[strum(serialize = "a")]
    Append,
}

/// What a single stream slot is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// A pipe held by the runner.
    Pipe(PipeMode),
    /// A file on disk.
    File {
        /// Target path.
        path: PathBuf,
        /// Open mode.
        mode: FileMode,
    },
    /// The null device.
    Null,
    /// The controller's own stream.
    Inherit,
}

impl Directive {
    /// Parses a word-list definition such as `["pipe", "w"]` or
    /// `["file", "/var/log/pool.log", "a"]`.
    ///
    /// An empty definition yields `Ok(None)`, meaning "remove this slot".
    pub fn parse<S: AsRef<str>>(definition: &[S]) -> Result<Option<Self>, RunnerError> {
        let words: Vec<&str> = definition.iter().map(AsRef::as_ref).collect();
        let reject = |reason: &str| RunnerError::InvalidDescriptor {
            definition: words.iter().map(|w| w.to_string()).collect(),
            reason: reason.to_string(),
        };

        let Some((head, rest)) = words.split_first() else {
            return Ok(None);
        };

        let kind = DirectiveKind::from_str(head)
            .map_err(|_| reject("expected one of pipe, file, null or inherit"))?;

        let directive = match (kind, rest) {
            (DirectiveKind::Pipe, [mode]) => Directive::Pipe(
                PipeMode::from_str(mode).map_err(|_| reject("pipe mode must be r or w"))?,
            ),
            (DirectiveKind::Pipe, _) => return Err(reject("pipe takes exactly one mode")),
            (DirectiveKind::File, [path, mode]) if !path.is_empty() => Directive::File {
                path: PathBuf::from(*path),
                mode: FileMode::from_str(mode)
                    .map_err(|_| reject("file mode must be r, w or a"))?,
            },
            (DirectiveKind::File, _) => {
                return Err(reject("file takes a non-empty path and a mode"));
            }
            (DirectiveKind::Null, []) => Directive::Null,
            (DirectiveKind::Inherit, []) => Directive::Inherit,
            (DirectiveKind::Null | DirectiveKind::Inherit, _) => {
                return Err(reject("null and inherit take no arguments"));
            }
        };

        Ok(Some(directive))
    }

    /// Rejects a pipe whose direction does not match `stream`.
    pub fn check_direction(&self, stream: Stream) -> Result<(), RunnerError> {
        match self {
            Directive::Pipe(mode) if *mode != stream.pipe_mode() => {
                Err(RunnerError::PipeDirection {
                    stream,
                    expected: stream.pipe_mode(),
                })
            }
            _ => Ok(()),
        }
    }

    fn open_file(path: &Path, mode: FileMode) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
            FileMode::Append => options.append(true).create(true),
        };
        options.open(path)
    }
}

/// Mapping from stream slot to directive.
///
/// A slot without a directive is not wired by the runner and the child
/// inherits the controller's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSpec {
    slots: BTreeMap<Stream, Directive>,
}

impl Default for DescriptorSpec {
    /// Pipes on all three streams.
    fn default() -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(Stream::Stdin, Directive::Pipe(PipeMode::Read));
        slots.insert(Stream::Stdout, Directive::Pipe(PipeMode::Write));
        slots.insert(Stream::Stderr, Directive::Pipe(PipeMode::Write));
        Self { slots }
    }
}

impl DescriptorSpec {
    /// Returns the directive for `stream`, if wired.
    pub fn get(&self, stream: Stream) -> Option<&Directive> {
        self.slots.get(&stream)
    }

    /// Wires `stream` to `directive`.
    pub fn set(&mut self, stream: Stream, directive: Directive) {
        self.slots.insert(stream, directive);
    }

    /// Unwires `stream`.
    pub fn remove(&mut self, stream: Stream) -> Option<Directive> {
        self.slots.remove(&stream)
    }

    /// Checks every wired pipe against the direction its slot requires.
    pub fn validate(&self) -> Result<(), RunnerError> {
        self.slots
            .iter()
            .try_for_each(|(stream, directive)| directive.check_direction(*stream))
    }

    /// Builds the [`Stdio`] for `stream`.
    ///
    /// Background children outlive the runner, so pipes are swapped for the
    /// null device there.
    pub(crate) fn stdio(&self, stream: Stream, background: bool) -> io::Result<Stdio> {
        let stdio = match self.slots.get(&stream) {
            None | Some(Directive::Inherit) => Stdio::inherit(),
            Some(Directive::Null) => Stdio::null(),
            Some(Directive::Pipe(_)) if background => {
                debug!("No reader for piped {stream} of a background process; using null");
                Stdio::null()
            }
            Some(Directive::Pipe(_)) => Stdio::piped(),
            Some(Directive::File { path, mode }) => {
                Stdio::from(Directive::open_file(path, *mode)?)
            }
        };
        Ok(stdio)
    }
}
