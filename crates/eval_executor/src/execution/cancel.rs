use tokio_util::sync::CancellationToken;

/// A one-way cancellation flag shared between the caller and the workers of a run.
///
/// Cancelling stops new attempts from being admitted; attempts already calling the unit
/// of work are allowed to finish. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A handle cancelled together with this one, whose own cancellation does not
    /// propagate back up. Scopes fail-fast to a single run.
    pub(crate) fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}
