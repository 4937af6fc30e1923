use std::fmt;
use std::path::PathBuf;

use wasm_bindgen::JsValue;

#[derive(Debug, thiserror::Error)]
pub enum GpxError {
    /// The GPX file could not be opened, read or written.
    #[error("Cannot access GPX file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document root is not <gpx>. Unrecoverable.
    #[error("Unexpected root element <{found}>, expected <gpx>")]
    FileFormat { found: String },

    #[error("XML parse error at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Parse cancelled")]
    Cancelled,

    /// The operation needs a stopped recording session.
    #[error("Recording session is still active")]
    SessionActive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpxError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}

impl From<GpxError> for JsValue {
    fn from(e: GpxError) -> Self {
        JsValue::from_str(&e.to_string())
    }
}

/// A recognized element whose content could not be converted.
///
/// Parsing continues past these; they downgrade the outcome to partial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub element: &'static str,
    pub value: String,
}

impl FieldIssue {
    pub(crate) fn new(element: &'static str, value: impl Into<String>) -> Self {
        Self {
            element,
            value: value.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid value '{}' in <{}>", self.value, self.element)
    }
}
