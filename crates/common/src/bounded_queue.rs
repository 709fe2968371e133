//! Bounded FIFO hand-off between record producers (tailers, retry
//! reinjection) and the dispatcher's worker pool.
//!
//! Producers either `try_send` (drop-on-full policy) or `send_timeout`
//! (blocking policy with a bound); receivers are a `Stream` shared by every
//! worker. The queue closes when the last sender drops.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    time::Duration,
};

use event_listener::Event;
use futures::{
    Future,
    Stream,
};
use parking_lot::Mutex;

use crate::metrics::log_queue_size;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Queue full")]
pub struct QueueFull;

pub fn new_bounded_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    assert!(capacity > 0, "Queue capacity must be positive");
    let inner = Mutex::new(Inner {
        buffer: VecDeque::new(),
        capacity,
        senders: 1,
    });
    let shared = Arc::new(Shared {
        inner,
        items: Event::new(),
        space: Event::new(),
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver {
            shared,
            listener: None,
        },
    )
}

struct Inner<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    senders: usize,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Notified once per push.
    items: Event,
    /// Notified once per pop.
    space: Event,
}

pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        let senders = {
            let mut inner = self.shared.inner.lock();
            inner.senders -= 1;
            inner.senders
        };
        if senders == 0 {
            // Queue is closed. Wake up all receivers so they return None.
            self.shared.items.notify(usize::MAX);
        }
    }
}

impl<T> QueueSender<T> {
    pub fn try_send(&self, item: T) -> Result<(), QueueFull> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.buffer.len() >= inner.capacity {
                return Err(QueueFull);
            }
            inner.buffer.push_back(item);
            log_queue_size(inner.buffer.len());
        }
        self.shared.items.notify_additional(1);
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for space. On timeout the item is
    /// dropped and the caller observes the outcome via the result.
    pub async fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueFull> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut item = Some(item);
        loop {
            let listener = {
                let mut inner = self.shared.inner.lock();
                if inner.buffer.len() < inner.capacity {
                    inner
                        .buffer
                        .push_back(item.take().expect("Item enqueued twice?"));
                    log_queue_size(inner.buffer.len());
                    drop(inner);
                    self.shared.items.notify_additional(1);
                    return Ok(());
                }
                self.shared.space.listen()
            };
            if tokio::time::timeout_at(deadline, listener).await.is_err() {
                return Err(QueueFull);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().capacity
    }

    /// Fill fraction in `[0, 1]`, the backpressure signal.
    pub fn utilization(&self) -> f64 {
        let inner = self.shared.inner.lock();
        inner.buffer.len() as f64 / inner.capacity as f64
    }
}

pub struct QueueReceiver<T> {
    shared: Arc<Shared<T>>,
    listener: Option<event_listener::EventListener>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            listener: None,
        }
    }
}

impl<T> QueueReceiver<T> {
    pub fn len(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Stream for QueueReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let s = &mut *self;
        loop {
            {
                let mut inner = s.shared.inner.lock();
                if let Some(item) = inner.buffer.pop_front() {
                    log_queue_size(inner.buffer.len());
                    drop(inner);
                    s.shared.space.notify_additional(1);
                    s.listener.take();
                    return Poll::Ready(Some(item));
                }
                if inner.senders == 0 {
                    return Poll::Ready(None);
                }
                if s.listener.is_none() {
                    s.listener = Some(s.shared.items.listen());
                }
            }
            let listener = s.listener.as_mut().expect("listener was just installed");
            match Pin::new(listener).poll(cx) {
                // The queue is still empty. The listener is stored for the
                // next poll, and it has registered with cx.waker to be woken
                // when an item is pushed.
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    s.listener.take();
                    continue;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::{
        new_bounded_queue,
        QueueFull,
    };

    #[tokio::test]
    async fn test_fifo_order() -> anyhow::Result<()> {
        let (sender, mut receiver) = new_bounded_queue(2);
        sender.try_send(1)?;
        sender.try_send(2)?;
        assert_eq!(sender.try_send(3), Err(QueueFull));
        assert_eq!(receiver.next().await, Some(1));
        sender.try_send(4)?;
        assert_eq!(receiver.next().await, Some(2));
        assert_eq!(receiver.next().await, Some(4));
        let wait_for_next = receiver.next();
        sender.try_send(5)?;
        assert_eq!(wait_for_next.await, Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_senders_and_receivers() -> anyhow::Result<()> {
        let (sender1, mut receiver1) = new_bounded_queue(2);
        let sender2 = sender1.clone();
        sender1.try_send(1)?;
        sender2.try_send(2)?;
        assert_eq!(sender1.try_send(3), Err(QueueFull));
        assert_eq!(receiver1.next().await, Some(1));
        sender1.try_send(4)?;
        let mut receiver2 = receiver1.clone();
        assert_eq!(receiver2.next().await, Some(2));
        assert_eq!(receiver1.next().await, Some(4));
        sender1.try_send(5)?;
        drop(sender1);
        assert_eq!(receiver1.next().await, Some(5));
        let wait1 = receiver1.next();
        let wait2 = receiver2.next();
        sender2.try_send(6)?;
        drop(sender2);
        assert_eq!(wait2.await, Some(6));
        assert_eq!(wait1.await, None);
        assert_eq!(receiver2.next().await, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_observes_deadline() -> anyhow::Result<()> {
        let (sender, mut receiver) = new_bounded_queue(1);
        sender.try_send(1)?;
        assert_eq!(
            sender.send_timeout(2, Duration::from_millis(50)).await,
            Err(QueueFull)
        );

        // A pop frees space while a sender is parked.
        let send = sender.send_timeout(3, Duration::from_secs(1));
        let (send_result, popped) = tokio::join!(send, receiver.next());
        assert_eq!(send_result, Ok(()));
        assert_eq!(popped, Some(1));
        assert_eq!(receiver.next().await, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_utilization() -> anyhow::Result<()> {
        let (sender, _receiver) = new_bounded_queue(4);
        assert_eq!(sender.utilization(), 0.0);
        sender.try_send(1)?;
        sender.try_send(2)?;
        assert_eq!(sender.utilization(), 0.5);
        Ok(())
    }
}
