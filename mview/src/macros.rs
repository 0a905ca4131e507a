//! Macros for building and returning [`crate::error::ViewError`]s.

/// Creates a [`crate::error::ViewError`] from an error kind and a static description.
///
/// Dynamic detail can follow either as `detail = <owned string>` or as any displayable value,
/// and a source error can be attached with `source: <error>`.
#[macro_export]
macro_rules! view_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ViewError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::ViewError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::ViewError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::ViewError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ViewError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::ViewError`], accepting the same arguments as
/// [`view_error!`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return ::core::result::Result::Err($crate::view_error!($($arg)+))
    };
}
