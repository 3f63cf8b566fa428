//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a cloneable signal backed by a
//! `tokio::sync::watch` channel. Child tokens observe their parent's
//! cancellation; cancelling a child leaves the parent untouched.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, parent: None }),
        }
    }

    /// Token cancelled together with `self`, or on its own.
    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolve once this token or an ancestor is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        async move {
            let mut rx = self.inner.tx.subscribe();
            match &self.inner.parent {
                None => {
                    // The sender lives as long as `self`, so this only returns on cancel
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                Some(parent) => {
                    tokio::select! {
                        _ = rx.wait_for(|cancelled| *cancelled) => {}
                        _ = parent.cancelled() => {}
                    }
                }
            }
        }
        .boxed()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
