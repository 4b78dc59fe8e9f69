use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    /// A structural limit was exceeded, e.g. more than 2^32 chunks.
    Limit(&'static str),
    /// The root of the scan is not a directory, or a listed path is invalid.
    BadInput(String),
    /// Mutually exclusive options were combined.
    IncompatibleOptions(&'static str),
    /// An option string failed to parse.
    BadOption(String),
    /// A filter or transform script failed; the build aborts.
    Script(Box<dyn std::error::Error + Send + Sync>),
    FreezeMetadata(dwarfs::metadata::Error),
    Section(dwarfs::section::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::BadInput(msg) => write!(f, "{msg}"),
            ErrorInner::IncompatibleOptions(msg) => write!(f, "incompatible options: {msg}"),
            ErrorInner::BadOption(msg) => write!(f, "invalid option: {msg}"),
            ErrorInner::Script(err) => write!(f, "script failed: {err}"),
            ErrorInner::FreezeMetadata(err) => err.fmt(f),
            ErrorInner::Section(err) => err.fmt(f),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Script(err) => Some(&**err),
            ErrorInner::FreezeMetadata(err) => Some(err),
            ErrorInner::Section(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<dwarfs::metadata::Error> for Error {
    #[cold]
    fn from(err: dwarfs::metadata::Error) -> Self {
        Self(Box::new(ErrorInner::FreezeMetadata(err)))
    }
}

impl From<dwarfs::section::Error> for Error {
    #[cold]
    fn from(err: dwarfs::section::Error) -> Self {
        Self(Box::new(ErrorInner::Section(err)))
    }
}

#[cold]
pub(crate) fn bad_input(msg: impl fmt::Display) -> Error {
    ErrorInner::BadInput(msg.to_string()).into()
}
