//! Per-task interruption signal
//!
//! 실행 중인 작업에 취소/선점/재위임 신호를 전달합니다.
//! `watch` 채널 위에 구현되어 있어 대기 중인 쪽은 폴링 없이 깨어납니다.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Why an in-flight attempt should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    None,
    /// Reservation was revoked for a higher-priority task; requeue
    Preempted,
    /// Agent is unreachable; requeue to another agent
    Redelegate,
    /// Stop for good
    Cancelled,
}

/// Cloneable handle shared by the worker and whoever interrupts it
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Interrupt>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Interrupt::None);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Interrupt {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.current() == Interrupt::Cancelled
    }

    pub fn cancel(&self) {
        self.raise(Interrupt::Cancelled);
    }

    pub fn preempt(&self) {
        self.raise(Interrupt::Preempted);
    }

    pub fn redelegate(&self) {
        self.raise(Interrupt::Redelegate);
    }

    /// Cancellation is sticky; other signals are cleared by `clear`
    fn raise(&self, signal: Interrupt) {
        self.tx.send_if_modified(|current| {
            if signal > *current {
                *current = signal;
                true
            } else {
                false
            }
        });
    }

    /// Acknowledge a non-final interrupt
    pub fn clear(&self) {
        self.tx.send_if_modified(|current| {
            if *current != Interrupt::Cancelled && *current != Interrupt::None {
                *current = Interrupt::None;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once any interrupt is raised
    pub async fn interrupted(&self) -> Interrupt {
        let mut rx = self.tx.subscribe();
        let signal = match rx.wait_for(|s| *s != Interrupt::None).await {
            Ok(signal) => *signal,
            // The sender lives in `self`, so this is unreachable while we hold it
            Err(_) => Interrupt::Cancelled,
        };
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupted_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.interrupted().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.preempt();
        assert_eq!(waiter.await.unwrap(), Interrupt::Preempted);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let token = CancelToken::new();
        token.cancel();
        token.preempt();
        token.clear();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clear_resets_preempt() {
        let token = CancelToken::new();
        token.redelegate();
        assert_eq!(token.current(), Interrupt::Redelegate);
        token.clear();
        assert_eq!(token.current(), Interrupt::None);
    }
}
