use thiserror::Error;

/// Strata build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed instruction list; no build is attempted
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Invalid or out-of-root path reference in a step
    #[error("Context error in step {step}: {message}")]
    Context { step: usize, message: String },

    /// A step's side-effecting action failed (non-zero exit, spawn failure)
    #[error("Step {step} failed: {message}")]
    BuildStep { step: usize, message: String },

    /// A step's subprocess exceeded its time limit
    #[error("Step {step} timed out after {seconds}s")]
    Timeout { step: usize, seconds: u64 },

    /// The build was cancelled while a step was running
    #[error("Build cancelled during step {step}")]
    Cancelled { step: usize },

    /// Base image reference could not be resolved
    #[error("Cannot resolve base image '{reference}': {message}")]
    Resolve { reference: String, message: String },

    /// Underlying storage failure
    #[error("Store error: {0}")]
    Store(String),

    /// Blob not present in the content store
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Image assembly requested over an empty layer chain
    #[error("Image has no layers: a FROM instruction is required")]
    EmptyChain,

    /// Image reference (tag or digest) is unknown
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A store, resolver or I/O failure raised while running a step
    #[error("Step {step} failed: {source}")]
    Step {
        step: usize,
        #[source]
        source: Box<BuildError>,
    },
}

impl BuildError {
    /// Index of the failing instruction, for step-level errors.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            BuildError::Context { step, .. }
            | BuildError::BuildStep { step, .. }
            | BuildError::Timeout { step, .. }
            | BuildError::Cancelled { step }
            | BuildError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Attach the failing step to errors that do not carry one already.
    pub fn at_step(self, step: usize) -> Self {
        if self.step_index().is_some() {
            return self;
        }
        BuildError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through `Step` wrappers.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether this error aborted a running step (as opposed to parsing or setup).
    pub fn is_step_failure(&self) -> bool {
        self.step_index().is_some()
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let error = BuildError::Parse {
            line: 3,
            message: "Unknown instruction 'ADD'".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Parse error at line 3: Unknown instruction 'ADD'"
        );
    }

    #[test]
    fn test_context_error_display() {
        let error = BuildError::Context {
            step: 2,
            message: "path escapes build context".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Context error in step 2: path escapes build context"
        );
    }

    #[test]
    fn test_timeout_error_display() {
        let error = BuildError::Timeout { step: 1, seconds: 30 };
        assert_eq!(error.to_string(), "Step 1 timed out after 30s");
    }

    #[test]
    fn test_step_index() {
        assert_eq!(
            BuildError::BuildStep {
                step: 4,
                message: "exit 1".to_string()
            }
            .step_index(),
            Some(4)
        );
        assert_eq!(BuildError::Cancelled { step: 0 }.step_index(), Some(0));
        assert_eq!(BuildError::EmptyChain.step_index(), None);
        assert!(!BuildError::Store("disk full".to_string()).is_step_failure());
    }

    #[test]
    fn test_at_step_wraps_unindexed_errors() {
        let wrapped = BuildError::Store("disk full".to_string()).at_step(3);
        assert_eq!(wrapped.step_index(), Some(3));
        assert!(wrapped.is_step_failure());
        assert!(matches!(wrapped.root_cause(), BuildError::Store(_)));
        assert_eq!(wrapped.to_string(), "Step 3 failed: Store error: disk full");

        let indexed = BuildError::Timeout { step: 1, seconds: 5 }.at_step(7);
        assert!(matches!(indexed, BuildError::Timeout { step: 1, .. }));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BuildError = io_error.into();
        assert!(matches!(error, BuildError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::Serialization(_)));
    }
}
