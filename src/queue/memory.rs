use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Broker, Delivery, QueueError, QueueNames, Redelivery, WorkUnit};

#[derive(Debug)]
struct Message {
    tag: i64,
    unit: WorkUnit,
    visible_at: Instant,
    claimed: Option<(String, Instant)>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    next_tag: i64,
}

/// In-process broker. Delays run on `tokio::time`, so paused-clock tests can
/// step through retry delays with `tokio::time::advance`.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("memory broker lock poisoned".to_string()))
    }

    /// Every message in `queue`, claimed or not, in queue order.
    pub fn peek(&self, queue: &str) -> Vec<WorkUnit> {
        match self.state.lock() {
            Ok(state) => state
                .queues
                .get(queue)
                .map(|q| q.iter().map(|m| m.unit.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

fn remove_tag(state: &mut State, queue: &str, tag: i64) {
    if let Some(messages) = state.queues.get_mut(queue) {
        messages.retain(|m| m.tag != tag);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, unit: &WorkUnit, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.queues.entry(queue.to_string()).or_default().push_back(Message {
            tag,
            unit: unit.clone(),
            visible_at: Instant::now() + delay,
            claimed: None,
        });
        Ok(())
    }

    async fn fetch(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let Some(messages) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let next = messages
            .iter_mut()
            .find(|m| m.claimed.is_none() && m.visible_at <= now);
        Ok(next.map(|m| {
            m.claimed = Some((consumer.to_string(), now));
            Delivery {
                tag: m.tag,
                queue: queue.to_string(),
                unit: m.unit.clone(),
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        remove_tag(&mut state, &delivery.queue, delivery.tag);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        remove_tag(&mut state, &delivery.queue, delivery.tag);
        Ok(())
    }

    async fn redeliver_due(&self, names: &QueueNames, max_retries: u32) -> Result<Redelivery, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let Some(retry) = state.queues.get_mut(&names.retry) else {
            return Ok(Redelivery::default());
        };

        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(retry.len());
        while let Some(message) = retry.pop_front() {
            if message.claimed.is_none() && message.visible_at <= now {
                due.push(message);
            } else {
                waiting.push_back(message);
            }
        }
        *retry = waiting;

        let mut outcome = Redelivery::default();
        for mut message in due {
            message.visible_at = now;
            let target = if message.unit.retry_count > max_retries {
                outcome.dead_lettered += 1;
                &names.dead_letter
            } else {
                outcome.redelivered += 1;
                &names.main
            };
            state.queues.entry(target.clone()).or_default().push_back(message);
        }
        Ok(outcome)
    }

    async fn recover_unacked(&self, older_than: Duration) -> Result<u64, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let mut recovered = 0;
        for messages in state.queues.values_mut() {
            for message in messages.iter_mut() {
                let stale = message
                    .claimed
                    .as_ref()
                    .is_some_and(|(_, at)| now.duration_since(*at) >= older_than);
                if stale {
                    message.claimed = None;
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let mut state = self.lock()?;
        Ok(state
            .queues
            .remove(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PROCESS_EVENTS;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_invisible_until_due() {
        let broker = MemoryBroker::new();
        let unit = WorkUnit::new(100, 109, PROCESS_EVENTS);
        broker.publish("q", &unit, Duration::from_secs(5)).await.unwrap();

        assert!(broker.fetch("q", "c").await.unwrap().is_none());
        assert_eq!(broker.depth("q").await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let delivery = broker.fetch("q", "c").await.unwrap().unwrap();
        assert_eq!(delivery.unit, unit);
    }

    #[tokio::test]
    async fn test_claimed_message_not_redelivered_until_acked() {
        let broker = MemoryBroker::new();
        broker
            .publish("q", &WorkUnit::new(1, 2, PROCESS_EVENTS), Duration::ZERO)
            .await
            .unwrap();

        let first = broker.fetch("q", "a").await.unwrap().unwrap();
        assert!(broker.fetch("q", "b").await.unwrap().is_none());
        broker.ack(&first).await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redeliver_routes_past_threshold_to_dead_letter() {
        let broker = MemoryBroker::new();
        let names = QueueNames::default();
        let mut unit = WorkUnit::new(1, 2, PROCESS_EVENTS);
        unit.retry_count = 3;
        broker.publish(&names.retry, &unit, Duration::ZERO).await.unwrap();
        unit.retry_count = 4;
        broker.publish(&names.retry, &unit, Duration::ZERO).await.unwrap();

        let outcome = broker.redeliver_due(&names, 3).await.unwrap();
        assert_eq!(
            outcome,
            Redelivery {
                redelivered: 1,
                dead_lettered: 1
            }
        );
        assert_eq!(broker.peek(&names.main)[0].retry_count, 3);
        assert_eq!(broker.peek(&names.dead_letter)[0].retry_count, 4);
        assert_eq!(broker.depth(&names.retry).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_unacked_makes_message_visible() {
        let broker = MemoryBroker::new();
        broker
            .publish("q", &WorkUnit::new(1, 2, PROCESS_EVENTS), Duration::ZERO)
            .await
            .unwrap();
        let _lost = broker.fetch("q", "crashed").await.unwrap().unwrap();

        assert_eq!(broker.recover_unacked(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(broker.recover_unacked(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(broker.fetch("q", "other").await.unwrap().is_some());
    }
}
