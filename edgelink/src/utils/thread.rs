use std::thread::JoinHandle;

/// Joins a worker thread, logging instead of propagating a panic so that
/// teardown always completes.
pub(crate) fn join<T>(handle: &mut Option<JoinHandle<T>>) {
    let Some(handle) = handle.take() else {
        return;
    };
    let name = handle
        .thread()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_default();
    log::trace!("joining thread `{name}`");
    if let Err(cause) = handle.join() {
        if let Some(s) = cause.downcast_ref::<&'static str>() {
            log::error!("thread `{name}` failed with panic: {s}");
        } else if let Some(s) = cause.downcast_ref::<String>() {
            log::error!("thread `{name}` failed with panic: {s}");
        } else {
            log::error!("thread `{name}` failed with panic that is not a string");
        }
    }
}
