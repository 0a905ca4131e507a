use tokio::task::{JoinError, JoinSet};

use crate::error::{ErrorKind, ViewError, ViewResult};
use crate::view_error;

/// Turns the outcome of a joined task into a [`ViewResult`].
///
/// Panics and cancellations of the task become errors naming `task`.
pub fn flatten_join<T>(result: Result<ViewResult<T>, JoinError>, task: &str) -> ViewResult<T> {
    result.map_err(|err| {
        if err.is_cancelled() {
            view_error!(
                ErrorKind::PipelineCancelled,
                "Task was cancelled",
                format!("{task}: {err}")
            )
        } else {
            view_error!(
                ErrorKind::PipelinePanicked,
                "Task panicked",
                format!("{task}: {err}")
            )
        }
    })?
}

/// Aggregates `first` with the failures of every task of `tasks` that already finished.
///
/// Tasks still running are left untouched.
#[track_caller]
pub fn collect_failures<T>(
    first: ViewError,
    tasks: &mut JoinSet<ViewResult<T>>,
    task: &str,
) -> ViewError
where
    T: 'static,
{
    let mut others = Vec::new();
    while let Some(result) = tasks.try_join_next() {
        if let Err(err) = flatten_join(result, task) {
            others.push(err);
        }
    }

    ViewError::aggregate(first, others)
}
