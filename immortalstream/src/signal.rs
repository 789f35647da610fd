//! One-shot permanent-failure notification.
//!
//! The reconnector fires it from whichever task observed the failure; the
//! owning stream listens and closes itself. Only the first `fire` is kept.

use tokio::sync::watch;

/// Details of the failure that made reconnecting futile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub status: u16,
    pub message: String,
}

/// Sending side. Cheap to share behind the reconnector.
#[derive(Debug)]
pub struct FailureSignal {
    tx: watch::Sender<Option<PermanentFailure>>,
}

impl FailureSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record the failure. Returns `false` if it had already fired.
    pub fn fire(&self, failure: PermanentFailure) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(failure);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn listen(&self) -> FailureListener {
        FailureListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for FailureSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side.
#[derive(Debug, Clone)]
pub struct FailureListener {
    rx: watch::Receiver<Option<PermanentFailure>>,
}

impl FailureListener {
    /// The failure, if it has fired.
    pub fn get(&self) -> Option<PermanentFailure> {
        self.rx.borrow().clone()
    }

    /// Wait until the signal fires. Returns `None` if the signal was dropped
    /// without firing.
    pub async fn fired(&mut self) -> Option<PermanentFailure> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}
