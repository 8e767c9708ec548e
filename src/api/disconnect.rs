use crate::core::CancelHandle;

/// Fires the request's cancel handle if the handler future is dropped before
/// the response was handed to the client.
pub struct DisconnectGuard {
    cancel_handle: CancelHandle,
}

impl DisconnectGuard {
    pub fn new(cancel_handle: CancelHandle) -> Self {
        Self { cancel_handle }
    }

    /// The response is on its way; dropping the guard is no longer a disconnect.
    pub fn disarm(self) {
        self.cancel_handle.mark_completed();
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.cancel_handle.is_completed() {
            tracing::info!("Client disconnected before response, cancelling routing");
            self.cancel_handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_cancels_when_dropped_armed() {
        let handle = CancelHandle::new();
        drop(DisconnectGuard::new(handle.clone()));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_disarmed_guard_does_not_cancel() {
        let handle = CancelHandle::new();
        DisconnectGuard::new(handle.clone()).disarm();
        assert!(!handle.is_cancelled());
        assert!(handle.is_completed());
    }
}
