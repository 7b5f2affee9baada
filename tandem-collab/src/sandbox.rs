//! Code execution seam.
//!
//! Sessions hold source code, and some frontends let participants run it.
//! Execution itself is out of scope here; this module only defines the
//! trait a runner plugs into, so the server can stay oblivious to how
//! (or whether) code actually runs.

/// Languages a runner may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    /// Parse from the identifiers frontends send.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "python" => Some(Self::Python),
            "javascript" => Some(Self::JavaScript),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }
}

/// Captured output of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub enum RunError {
    UnsupportedLanguage(Language),
    Failed(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLanguage(lang) => {
                write!(f, "no runner for language '{}'", lang.tag())
            }
            Self::Failed(e) => write!(f, "execution failed: {e}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Something that can execute a piece of source code.
pub trait CodeRunner: Send + Sync {
    fn run(&self, source: &str, language: Language) -> Result<RunOutput, RunError>;
}
