use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ClassReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool tag {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid constant pool index {0}")]
    InvalidIndex(u16),
    #[error("invalid attribute {0}")]
    InvalidAttribute(String),
    #[error("invalid opcode 0x{opcode:02x} at {offset}")]
    InvalidOpcode {
        /// The opcode that caused the error.
        opcode: u8,
        /// Offset into the code array where the error occurred.
        offset: usize,
    },
    #[error("modified utf8 error: {0}")]
    Utf8Error(String),
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassWriteError {
    #[error("constant pool overflow: {0} entries")]
    ConstantPoolOverflow(usize),
    #[error("invalid constant pool reference {0}")]
    InvalidConstantPool(u16),
    #[error("unresolved label {0}")]
    UnresolvedLabel(usize),
    #[error("utf8 constant too long: {0} bytes")]
    Utf8TooLong(usize),
    #[error("method code too large: {0} bytes")]
    CodeTooLarge(usize),
    #[error("frame computation error: {0}")]
    FrameComputation(String),
    #[error("cannot compute frames")]
    Hierarchy(#[from] HierarchyError),
    #[error("malformed method body")]
    Malformed(#[from] ClassReadError),
}

/// Failure to look up the ancestry of a class.
#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    #[error("class {name} not found on the classpath")]
    Missing { name: String },
    #[error("failed to read {name} from {}", .path.display())]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed class file for {name}")]
    Malformed {
        name: String,
        #[source]
        source: ClassReadError,
    },
}

impl HierarchyError {
    /// The class that could not be resolved.
    pub fn class_name(&self) -> &str {
        match self {
            HierarchyError::Missing { name }
            | HierarchyError::Io { name, .. }
            | HierarchyError::Malformed { name, .. } => name,
        }
    }
}

/// Per-class conversion failure. Never shared between classes of a batch.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("malformed class file {}", .class.as_deref().unwrap_or("<unknown>"))]
    Malformed {
        class: Option<String>,
        #[source]
        source: ClassReadError,
    },
    #[error("cannot resolve ancestor {missing} while converting {class}")]
    Resolution {
        class: String,
        missing: String,
        #[source]
        source: HierarchyError,
    },
    #[error("{class}.{method}: {reason}; refusing to record an unknown location")]
    MissingDebugInfo {
        class: String,
        method: String,
        reason: &'static str,
    },
    #[error("{class} has class version {major}; supplier call sites need at least 51")]
    UnsupportedVersion { class: String, major: u16 },
    #[error("failed to write {class}")]
    Write {
        class: String,
        #[source]
        source: ClassWriteError,
    },
}

impl ConvertError {
    pub(crate) fn write(class: &str, source: ClassWriteError) -> Self {
        match source {
            ClassWriteError::Hierarchy(source) => ConvertError::Resolution {
                class: class.to_string(),
                missing: source.class_name().to_string(),
                source,
            },
            source => ConvertError::Write {
                class: class.to_string(),
                source,
            },
        }
    }

    /// Name of the class the failure belongs to, when it is known.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            ConvertError::Malformed { class, .. } => class.as_deref(),
            ConvertError::Resolution { class, .. }
            | ConvertError::MissingDebugInfo { class, .. }
            | ConvertError::UnsupportedVersion { class, .. }
            | ConvertError::Write { class, .. } => Some(class),
        }
    }
}

/// Failure of a whole batch, as opposed to one of its classes.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("invalid input pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("cannot list {}", .0.path().display())]
    Glob(#[from] glob::GlobError),
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to emit cache classes")]
    Emit(#[from] ConvertError),
}
