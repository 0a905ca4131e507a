use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::hub::Subscription;
use crate::types::ViewSnapshot;

/// Default timeout for waiting on a view.
///
/// Pipelines under test run against in-memory sources, so reaching any state should not take
/// more than a few seconds.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Waits until `subscription` receives a view matching `condition` and returns it.
///
/// # Panics
///
/// Panics if no matching view is received within [`DEFAULT_WAIT_TIMEOUT`].
pub async fn wait_for_view<F>(
    subscription: &mut Subscription<ViewSnapshot>,
    condition: F,
) -> Arc<ViewSnapshot>
where
    F: Fn(&ViewSnapshot) -> bool,
{
    wait_for_view_with_timeout(subscription, condition, DEFAULT_WAIT_TIMEOUT).await
}

/// Same as [`wait_for_view`] with a custom timeout.
pub async fn wait_for_view_with_timeout<F>(
    subscription: &mut Subscription<ViewSnapshot>,
    condition: F,
    timeout_duration: Duration,
) -> Arc<ViewSnapshot>
where
    F: Fn(&ViewSnapshot) -> bool,
{
    let matching = async {
        loop {
            let view = subscription.next().await;
            if condition(&view) {
                return view;
            }
        }
    };

    match timeout(timeout_duration, matching).await {
        Ok(view) => view,
        Err(_) => panic!(
            "Waiting for a view timed out after {timeout_duration:?}. \
             This likely indicates the expected state was never reached. \
             Check if the pipeline is running correctly or if the condition is reachable."
        ),
    }
}

/// Returns the `attribute` of the row stored under `key`, if any.
pub fn row_value<'a>(view: &'a ViewSnapshot, key: &str, attribute: &str) -> Option<&'a str> {
    view.get(key)?.get(attribute).map(String::as_str)
}
