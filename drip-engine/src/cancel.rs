use tokio::sync::watch;

/// A one-way cancellation signal shared by every task of a node run.
///
/// Raised either by user action or by "winner found"; observers pick it up
/// at their next suspension point via [`CancelToken::cancelled`] inside a
/// `tokio::select!` arm, never by polling a shared boolean.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

/// The observing end of a [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Raises the signal. Idempotent, and independent of whether any token
    /// exists yet: tokens created afterwards still observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Resolves once the signal is raised; pends forever if the signal is
    /// dropped without ever being raised.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender gone without cancelling: this run will never be cancelled.
        std::future::pending::<()>().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}
