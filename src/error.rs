use std::io;

/// Classifies a [`Qcow2Error`] so callers can branch without matching
/// on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qcow2ErrorKind {
    /// A caller-supplied option violates a static rule.
    Invalid,
    /// Valid request, but the operation is not implemented.
    Unsupported,
    /// An on-disk invariant is violated.
    Corrupt,
    /// The image carries an incompatible-feature bit we don't know.
    IncompatibleFeature,
    /// Host I/O failure.
    Io,
    /// A refcount increment would exceed refcount_max.
    RefcountOverflow,
    /// A refcount decrement would go below zero.
    RefcountUnderflow,
    /// EOF before the requested number of bytes.
    ShortRead,
}

#[derive(Debug, Clone)]
pub struct Qcow2Error {
    kind: Qcow2ErrorKind,
    description: String,
}

pub type Qcow2Result<R> = Result<R, Qcow2Error>;

impl Qcow2Error {
    pub fn new<S: Into<String>>(kind: Qcow2ErrorKind, description: S) -> Self {
        Qcow2Error {
            kind,
            description: description.into(),
        }
    }

    pub fn invalid<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::Invalid, description)
    }

    pub fn unsupported<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::Unsupported, description)
    }

    pub fn corrupt<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::Corrupt, description)
    }

    pub fn incompatible_feature<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::IncompatibleFeature, description)
    }

    pub fn io<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::Io, description)
    }

    pub fn refcount_overflow<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::RefcountOverflow, description)
    }

    pub fn refcount_underflow<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::RefcountUnderflow, description)
    }

    pub fn short_read<S: Into<String>>(description: S) -> Self {
        Self::new(Qcow2ErrorKind::ShortRead, description)
    }

    pub fn kind(&self) -> Qcow2ErrorKind {
        self.kind
    }

    pub fn into_description(self) -> String {
        self.description
    }

    #[must_use]
    pub fn prepend(mut self, prefix: &str) -> Self {
        self.description = format!("{}: {}", prefix, self.description);
        self
    }
}

impl From<io::Error> for Qcow2Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::UnexpectedEof => Qcow2ErrorKind::ShortRead,
            _ => Qcow2ErrorKind::Io,
        };
        Qcow2Error::new(kind, err.to_string())
    }
}

impl From<nix::errno::Errno> for Qcow2Error {
    fn from(err: nix::errno::Errno) -> Self {
        Qcow2Error::io(err.to_string())
    }
}

macro_rules! impl_from {
    ($type:ty, $kind:ident) => {
        impl From<$type> for Qcow2Error {
            fn from(err: $type) -> Self {
                Qcow2Error::new(Qcow2ErrorKind::$kind, err.to_string())
            }
        }
    };
}

impl_from!(Box<bincode::ErrorKind>, Corrupt);
impl_from!(std::num::TryFromIntError, Invalid);
impl_from!(std::str::Utf8Error, Corrupt);

impl std::fmt::Display for Qcow2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for Qcow2Error {}
