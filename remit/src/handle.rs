//! Thin handles onto engine threads.
//!
//! Handles reference the engine and a thread id only, never the thread
//! record itself, so they stay valid across persistence and restarts and
//! introduce no cycles into the persisted state.

use std::fmt;
use std::time::Duration;

use common::envelope::{Invoice, Receipt, Settlement};
use common::ids::ThreadId;
use common::thread::{Thread, ThreadState};

use crate::error::Error;
use crate::manager::RemittanceManager;

/// A reference to one exchange thread.
#[derive(Clone)]
pub struct ThreadHandle {
    manager: RemittanceManager,
    thread_id: ThreadId,
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl ThreadHandle {
    pub(crate) fn new(
        manager: RemittanceManager,
        thread_id: ThreadId,
    ) -> Self {
        Self { manager, thread_id }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// A snapshot of the current thread record.
    pub async fn thread(&self) -> Result<Thread, Error> {
        self.manager.get_thread_or_err(&self.thread_id).await
    }

    pub async fn state(&self) -> Result<ThreadState, Error> {
        Ok(self.thread().await?.state())
    }

    pub async fn wait_for_state(
        &self,
        target: ThreadState,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.manager
            .wait_for_state(&self.thread_id, target, timeout)
            .await
    }
}

/// A reference to an invoice we issued (maker side).
#[derive(Clone)]
pub struct InvoiceHandle {
    inner: ThreadHandle,
}

impl fmt::Debug for InvoiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvoiceHandle")
            .field("inner", &self.inner)
            .finish()
    }
}

impl InvoiceHandle {
    pub(crate) fn new(
        manager: RemittanceManager,
        thread_id: ThreadId,
    ) -> Self {
        Self {
            inner: ThreadHandle::new(manager, thread_id),
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        self.inner.thread_id()
    }

    pub async fn thread(&self) -> Result<Thread, Error> {
        self.inner.thread().await
    }

    /// The invoice as sent.
    pub async fn invoice(&self) -> Result<Invoice, Error> {
        let thread_id = self.thread_id();
        self.inner.thread().await?.invoice.ok_or_else(|| {
            Error::Precondition(format!(
                "Thread {thread_id} has no invoice",
            ))
        })
    }

    /// Waits for the counterparty's settlement.
    pub async fn wait_for_settlement(
        &self,
        timeout: Duration,
    ) -> Result<Settlement, Error> {
        self.inner
            .manager
            .wait_for_settlement(self.thread_id(), timeout)
            .await
    }

    /// Waits for the receipt we issue once a settlement is accepted.
    pub async fn wait_for_receipt(
        &self,
        timeout: Duration,
    ) -> Result<Receipt, Error> {
        self.inner
            .manager
            .wait_for_receipt(self.thread_id(), timeout)
            .await
    }
}
