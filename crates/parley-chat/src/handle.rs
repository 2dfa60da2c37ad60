use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

type Release = Box<dyn FnOnce() + Send>;

/// Handle returned by every subscription.
///
/// `cancel` is idempotent: the first call stops delivery and releases the
/// underlying listener, later calls (from any clone) do nothing. Dropping the
/// handle does not cancel.
#[derive(Clone)]
#[must_use = "keep the handle to be able to cancel the subscription"]
pub struct CancelHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    token: CancellationToken,
    release: Mutex<Option<Release>>,
}

impl CancelHandle {
    pub(crate) fn new(token: CancellationToken, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                token,
                release: Mutex::new(Some(Box::new(release))),
            }),
        }
    }

    pub fn cancel(&self) {
        let release = self
            .inner
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(release) = release {
            // Flip the token first so no delivery starts after this returns.
            self.inner.token.cancel();
            release();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
