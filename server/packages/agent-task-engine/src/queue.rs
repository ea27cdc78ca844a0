//! Per-agent FIFO lanes for sequential executions.
//!
//! A request takes its place in the lane with [`SequentialQueue::enqueue`],
//! which never waits, so lane order is the order in which requests arrived.
//! The returned [`LaneTicket`] is later awaited for the [`LanePermit`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Lane {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// One lane per agent with a single holder at a time.
#[derive(Debug, Clone, Default)]
pub struct SequentialQueue {
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
}

#[derive(Debug)]
enum TicketState {
    Granted,
    Waiting(oneshot::Receiver<()>),
}

/// A reserved position in an agent's lane.
#[derive(Debug)]
pub struct LaneTicket {
    queue: SequentialQueue,
    agent_id: String,
    state: Option<TicketState>,
}

/// Held for the whole sequential execution, including its terminal write.
#[derive(Debug)]
pub struct LanePermit {
    queue: SequentialQueue,
    agent_id: String,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next position in the agent's lane.
    pub fn enqueue(&self, agent_id: &str) -> LaneTicket {
        let mut lanes = self.lock();
        let lane = lanes.entry(agent_id.to_string()).or_default();
        let state = if lane.busy {
            let (tx, rx) = oneshot::channel();
            lane.waiters.push_back(tx);
            TicketState::Waiting(rx)
        } else {
            lane.busy = true;
            TicketState::Granted
        };
        tracing::debug!(agent_id, queued = lane.waiters.len(), "entered sequential lane");
        LaneTicket {
            queue: self.clone(),
            agent_id: agent_id.to_string(),
            state: Some(state),
        }
    }

    /// Enqueues and waits in one step.
    pub async fn acquire(&self, agent_id: &str) -> LanePermit {
        self.enqueue(agent_id).acquire().await
    }

    /// Executions waiting for the agent's lane, excluding the one holding it.
    pub fn waiting(&self, agent_id: &str) -> usize {
        self.lock().get(agent_id).map_or(0, |lane| {
            lane.waiters
                .iter()
                .filter(|waiter| !waiter.is_closed())
                .count()
        })
    }

    /// Hands the lane to the oldest live waiter, or frees it.
    fn release(&self, agent_id: &str) {
        let mut lanes = self.lock();
        let Some(lane) = lanes.get_mut(agent_id) else {
            return;
        };
        while let Some(waiter) = lane.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        lanes.remove(agent_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LaneTicket {
    pub async fn acquire(mut self) -> LanePermit {
        if let Some(TicketState::Waiting(rx)) = self.state.as_mut() {
            let _ = rx.await;
        }
        self.state = None;
        tracing::debug!(agent_id = %self.agent_id, "acquired sequential lane");
        LanePermit {
            queue: self.queue.clone(),
            agent_id: std::mem::take(&mut self.agent_id),
        }
    }
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        let granted = match self.state.take() {
            None => false,
            Some(TicketState::Granted) => true,
            Some(TicketState::Waiting(mut rx)) => {
                rx.close();
                rx.try_recv().is_ok()
            }
        };
        if granted {
            self.queue.release(&self.agent_id);
        }
    }
}

impl Drop for LanePermit {
    fn drop(&mut self) {
        self.queue.release(&self.agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lanes_run_in_enqueue_order_without_overlap() {
        let queue = SequentialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let first = queue.acquire("a").await;
        // Tickets are taken in order but the tasks are spawned in reverse,
        // so scheduling order cannot be what orders the lane.
        let tickets: Vec<_> = (0..5).map(|i| (i, queue.enqueue("a"))).collect();
        let mut tasks = Vec::new();
        for (i, ticket) in tickets.into_iter().rev() {
            let order = order.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = ticket.acquire().await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.waiting("a"), 5);
        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.waiting("a"), 0);
    }

    #[tokio::test]
    async fn abandoned_tickets_pass_the_lane_on() {
        let queue = SequentialQueue::new();
        let first = queue.acquire("a").await;
        let abandoned = queue.enqueue("a");
        let next = queue.enqueue("a");
        drop(abandoned);
        assert_eq!(queue.waiting("a"), 1);
        drop(first);

        let permit = tokio::time::timeout(Duration::from_millis(100), next.acquire()).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn a_granted_but_unclaimed_ticket_releases_on_drop() {
        let queue = SequentialQueue::new();
        let ticket = queue.enqueue("a");
        drop(ticket);
        let permit = tokio::time::timeout(Duration::from_millis(100), queue.acquire("a")).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn different_agents_do_not_block_each_other() {
        let queue = SequentialQueue::new();
        let _a = queue.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), queue.acquire("b")).await;
        assert!(b.is_ok());
    }
}
