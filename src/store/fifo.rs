//! The token FIFO enforcer.
//!
//! Every operation on a store first mints a token, fixing its place in the
//! request order. A read token becomes acquirable once every earlier write
//! has retired; a write token once every earlier read and write has
//! retired. Reads with no intervening write therefore overlap freely, while
//! anything involving a write observes strict mint order.
//!
//! A token retires when it is dropped — whether or not it was ever
//! acquired — so a waiter that gets interrupted releases its slot instead
//! of wedging everything minted after it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    reads_minted: u64,
    writes_minted: u64,
    reads_retired: u64,
    writes_retired: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Mints and admits tokens for one store.
#[derive(Debug, Default)]
pub(crate) struct FifoEnforcer {
    shared: Arc<Shared>,
}

impl FifoEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_read(&self) -> ReadToken {
        let mut state = self.shared.state.lock();
        state.reads_minted += 1;
        ReadToken {
            shared: self.shared.clone(),
            writes_before: state.writes_minted,
        }
    }

    pub fn enter_write(&self) -> WriteToken {
        let mut state = self.shared.state.lock();
        state.writes_minted += 1;
        WriteToken {
            shared: self.shared.clone(),
            reads_before: state.reads_minted,
            writes_before: state.writes_minted - 1,
        }
    }
}

async fn wait_until(shared: &Shared, ready: impl Fn(&State) -> bool) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if ready(&shared.state.lock()) {
            return;
        }
        notified.await;
    }
}

/// A minted read slot. Acquirable once every earlier write has retired.
#[derive(Debug)]
pub struct ReadToken {
    shared: Arc<Shared>,
    writes_before: u64,
}

impl ReadToken {
    pub(crate) async fn acquire(&self) {
        let writes_before = self.writes_before;
        wait_until(self.shared.as_ref(), |state| {
            state.writes_retired >= writes_before
        })
        .await;
    }
}

impl Drop for ReadToken {
    fn drop(&mut self) {
        self.shared.state.lock().reads_retired += 1;
        self.shared.notify.notify_waiters();
    }
}

/// A minted write slot. Acquirable once every earlier read and write has
/// retired.
#[derive(Debug)]
pub struct WriteToken {
    shared: Arc<Shared>,
    reads_before: u64,
    writes_before: u64,
}

impl WriteToken {
    pub(crate) async fn acquire(&self) {
        let (reads_before, writes_before) = (self.reads_before, self.writes_before);
        wait_until(self.shared.as_ref(), |state| {
            state.reads_retired >= reads_before && state.writes_retired >= writes_before
        })
        .await;
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.shared.state.lock().writes_retired += 1;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reads_overlap_without_writes() {
        let enforcer = FifoEnforcer::new();
        let a = enforcer.enter_read();
        let b = enforcer.enter_read();

        timeout(Duration::from_millis(50), a.acquire()).await.unwrap();
        timeout(Duration::from_millis(50), b.acquire()).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_waits_for_earlier_read() {
        let enforcer = FifoEnforcer::new();
        let read = enforcer.enter_read();
        let write = enforcer.enter_write();

        read.acquire().await;
        assert!(timeout(Duration::from_millis(20), write.acquire())
            .await
            .is_err());

        drop(read);
        timeout(Duration::from_millis(50), write.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_waits_for_earlier_write() {
        let enforcer = FifoEnforcer::new();
        let write = enforcer.enter_write();
        let read = enforcer.enter_read();

        assert!(timeout(Duration::from_millis(20), read.acquire())
            .await
            .is_err());

        drop(write);
        timeout(Duration::from_millis(50), read.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writes_admit_in_mint_order() {
        let enforcer = FifoEnforcer::new();
        let first = enforcer.enter_write();
        let second = enforcer.enter_write();

        first.acquire().await;
        assert!(timeout(Duration::from_millis(20), second.acquire())
            .await
            .is_err());

        drop(first);
        timeout(Duration::from_millis(50), second.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_unacquired_token_unblocks_later_ones() {
        let enforcer = FifoEnforcer::new();
        let blocker = enforcer.enter_write();
        let abandoned = enforcer.enter_write();
        let last = enforcer.enter_write();

        // The abandoned waiter is interrupted and never acquires; dropping
        // it must not wedge the queue.
        drop(abandoned);
        drop(blocker);

        timeout(Duration::from_millis(50), last.acquire())
            .await
            .unwrap();
    }
}
