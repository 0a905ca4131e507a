//! Error types and result definitions for view pipelines.
//!
//! [`ViewError`] carries a classification, a static description, optional dynamic detail and
//! the location it was raised from. Failures of several tasks can be aggregated into a single
//! error so that a pipeline run reports everything that went wrong at once.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use config::shared::ValidationError;
use source::error::SourceError;

/// Convenient result type for view operations.
pub type ViewResult<T> = Result<T, ViewError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for view pipelines.
#[derive(Debug, Clone)]
pub struct ViewError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures of several tasks, such as shard consumers failing together.
    Many {
        first: Box<ViewError>,
        others: Vec<ViewError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur while maintaining a view.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source errors
    SourceConnectionFailed,
    SourceThrottled,
    SourceQueryFailed,
    SourceTableNotFound,

    // Stream errors
    StreamNotFound,
    ShardNotFound,
    ShardCursorExpired,

    // Data errors
    MissingKeyAttribute,
    InvalidData,

    // Configuration errors
    ConfigError,

    // Workflow errors
    PipelinePanicked,
    PipelineCancelled,
    PipelineCompleted,
}

impl ErrorKind {
    /// Returns `true` for kinds expected to resolve without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::SourceThrottled
                | ErrorKind::SourceQueryFailed
                | ErrorKind::ShardCursorExpired
                | ErrorKind::PipelineCompleted
        )
    }
}

impl ViewError {
    /// Aggregates `first` with the failures that came along with it.
    ///
    /// Without `others`, `first` is returned as is.
    #[track_caller]
    pub fn aggregate(first: ViewError, others: Vec<ViewError>) -> ViewError {
        if others.is_empty() {
            return first;
        }

        ViewError {
            repr: ErrorRepr::Many {
                first: Box::new(first),
                others,
                location: Location::caller(),
            },
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// Aggregated errors report the kind of their first error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref first, .. } => first.kind(),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many {
                ref first,
                ref others,
                ..
            } => std::iter::once(&**first)
                .chain(others)
                .flat_map(ViewError::kinds)
                .collect(),
        }
    }

    /// Returns `true` when every contained error is transient.
    pub fn is_transient(&self) -> bool {
        self.kinds().iter().all(ErrorKind::is_transient)
    }

    /// Returns the dynamic detail of this error, or of the first aggregated error having one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many {
                ref first,
                ref others,
                ..
            } => std::iter::once(&**first)
                .chain(others)
                .find_map(ViewError::detail),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ViewError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for ViewError {
    fn eq(&self, other: &ViewError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    first: a_first,
                    others: a_others,
                    ..
                },
                ErrorRepr::Many {
                    first: b_first,
                    others: b_others,
                    ..
                },
            ) => a_first == b_first && a_others == b_others,
            _ => false,
        }
    }
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_indented(f, "Detail", payload.detail.as_deref())?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace", Some(&backtrace))?;
                }

                Ok(())
            }
            ErrorRepr::Many {
                first,
                others,
                location,
            } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}:{}",
                    others.len() + 1,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in std::iter::once(&**first).chain(others).enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ViewError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { first, .. } => Some(&**first as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes a titled block, indenting every line of `body` under the title.
fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, body: Option<&str>) -> fmt::Result {
    let Some(body) = body else {
        return Ok(());
    };

    if body.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for ViewError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ViewError {
        ViewError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ViewError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ViewError {
        ViewError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

impl From<SourceError> for ViewError {
    #[track_caller]
    fn from(err: SourceError) -> ViewError {
        let (kind, description) = match &err {
            SourceError::Connection(_) => {
                (ErrorKind::SourceConnectionFailed, "Source connection failed")
            }
            SourceError::Throttled(_) => (ErrorKind::SourceThrottled, "Source request throttled"),
            SourceError::TableNotFound(_) => {
                (ErrorKind::SourceTableNotFound, "Source table not found")
            }
            SourceError::StreamNotFound(_) => (ErrorKind::StreamNotFound, "Stream not found"),
            SourceError::ShardNotFound { .. } => (ErrorKind::ShardNotFound, "Shard not found"),
            SourceError::ExpiredCursor(_) => {
                (ErrorKind::ShardCursorExpired, "Shard cursor expired")
            }
            SourceError::Validation(_) | SourceError::Service(_) => {
                (ErrorKind::SourceQueryFailed, "Source request failed")
            }
        };

        ViewError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(err.to_string())),
            Some(Arc::new(err)),
        )
    }
}

impl From<ValidationError> for ViewError {
    #[track_caller]
    fn from(err: ValidationError) -> ViewError {
        ViewError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid view configuration"),
            Some(Cow::Owned(err.to_string())),
            Some(Arc::new(err)),
        )
    }
}
