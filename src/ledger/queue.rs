use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::RecvError, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Violation};
use crate::tokio_tools::spawn_named_task;

use super::messages::{Action, Envelope, LedgerEntry};
use super::transport::Transport;
use super::types::{ClientId, LedgerSequence};

const LOG_TARGET: &str = "mental_poker::ledger::queue";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
}

/// FIFO buffer with a FIFO list of single-shot waiters.
///
/// A pushed item goes to the oldest live waiter, or is buffered when nobody
/// waits. Each waiter receives exactly one distinct item. The cursor only
/// moves when a waiter actually takes its item.
pub struct FifoInbox {
    state: Mutex<InboxState>,
}

struct InboxState {
    items: VecDeque<LedgerEntry>,
    waiters: VecDeque<Sender<LedgerEntry>>,
    next_cursor: LedgerSequence,
    failure: Option<Violation>,
    closed: bool,
}

impl FifoInbox {
    pub fn new(cursor: LedgerSequence) -> Self {
        Self {
            state: Mutex::new(InboxState {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                next_cursor: cursor,
                failure: None,
                closed: false,
            }),
        }
    }

    pub fn push(&self, item: LedgerEntry) -> Result<(), QueueError> {
        let mut pending = Some(item);

        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.closed || state.failure.is_some() {
                    return Err(QueueError::Closed);
                }
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        if let Some(item) = pending.take() {
                            state.items.push_back(item);
                        }
                        return Ok(());
                    }
                }
            };

            let Some(value) = pending.take() else {
                return Ok(());
            };
            match waiter.send(value) {
                Ok(()) => return Ok(()),
                Err(value) => pending = Some(value),
            }
        }
    }

    pub fn pop(&self) -> PendingEntry<'_> {
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        if let Some(item) = state.items.pop_front() {
            if let Err(item) = tx.send(item) {
                state.items.push_front(item);
            }
        } else if !state.closed && state.failure.is_none() {
            state.waiters.push_back(tx);
        }

        PendingEntry {
            inbox: self,
            rx,
            settled: false,
        }
    }

    /// Puts back an item whose waiter went away before taking it. It stays
    /// ahead of everything pushed after it.
    fn restore(&self, item: LedgerEntry) {
        let mut state = self.state.lock();
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        state.items.push_front(item);
    }

    /// Marks the feed as broken. Buffered items are still handed out; waiters
    /// beyond them observe the failure.
    pub fn fail(&self, violation: Violation) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(violation);
        }
        state.waiters.clear();
    }

    /// No further items will arrive. Buffered items are still handed out.
    pub fn end_of_feed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }

    pub fn failure(&self) -> Option<Violation> {
        self.state.lock().failure.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> LedgerSequence {
        self.state.lock().next_cursor
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.waiters.clear();
        state.items.clear();
    }

    fn advance(&self, sequence: LedgerSequence) {
        let mut state = self.state.lock();
        state.next_cursor = state.next_cursor.max(sequence + 1);
    }
}

/// One pending [`FifoInbox::pop`].
///
/// Resolving it moves the inbox cursor past the entry before the caller sees
/// it. Dropping it unresolved returns an already delivered entry to the inbox,
/// so a timed-out or cancelled dequeue loses nothing.
pub struct PendingEntry<'a> {
    inbox: &'a FifoInbox,
    rx: Receiver<LedgerEntry>,
    settled: bool,
}

impl Future for PendingEntry<'_> {
    type Output = Result<LedgerEntry, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(entry)) => {
                this.settled = true;
                this.inbox.advance(entry.sequence);
                Poll::Ready(Ok(entry))
            }
            Poll::Ready(Err(err)) => {
                this.settled = true;
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(entry) = self.rx.try_recv() {
            self.inbox.restore(entry);
        }
    }
}

impl fmt::Debug for FifoInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FifoInbox")
            .field("pending_items", &state.items.len())
            .field("waiting_receivers", &state.waiters.len())
            .field("cursor", &state.next_cursor)
            .field("failed", &state.failure.is_some())
            .finish()
    }
}

/// One participant's view of the ledger: already-appended history followed by
/// live appends, delivered through [`ActionQueue::dequeue`] exactly once each
/// and in ledger order.
pub struct ActionQueue {
    client_id: ClientId,
    transport: Arc<dyn Transport>,
    inbox: Arc<FifoInbox>,
    pump: JoinHandle<()>,
}

impl ActionQueue {
    /// Attaches at the start of the ledger.
    pub fn attach(client_id: ClientId, transport: Arc<dyn Transport>) -> Result<Self, ProtocolError> {
        Self::attach_at(client_id, transport, 0)
    }

    /// Attaches at `cursor`, skipping entries already consumed elsewhere.
    pub fn attach_at(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        cursor: LedgerSequence,
    ) -> Result<Self, ProtocolError> {
        let mut feed = transport.subscribe(cursor)?;
        let inbox = Arc::new(FifoInbox::new(cursor));

        let pump_inbox = Arc::clone(&inbox);
        let pump_client = client_id.clone();
        let pump = spawn_named_task(format!("action-queue-{client_id}"), async move {
            while let Some(item) = feed.next().await {
                match item {
                    Ok(entry) => {
                        if pump_inbox.push(entry).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::PeerViolation(violation)) => {
                        warn!(
                            target = LOG_TARGET,
                            client_id = %pump_client,
                            error = %violation,
                            "inbound action rejected; failing queue"
                        );
                        pump_inbox.fail(violation);
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target = LOG_TARGET,
                            client_id = %pump_client,
                            error = %err,
                            "ledger feed failed; closing queue"
                        );
                        pump_inbox.end_of_feed();
                        break;
                    }
                }
            }
            pump_inbox.end_of_feed();
            debug!(target = LOG_TARGET, client_id = %pump_client, "ledger feed ended");
        });

        debug!(target = LOG_TARGET, client_id = %client_id, cursor, "attached action queue");
        Ok(Self {
            client_id,
            transport,
            inbox,
            pump,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Appends an action to the ledger. It comes back through `dequeue` like
    /// any peer action.
    pub async fn enqueue(&self, action: Action) -> Result<LedgerSequence, ProtocolError> {
        let kind = action.kind();
        let sequence = self.transport.post(Envelope::unsigned(action)).await?;
        debug!(
            target = LOG_TARGET,
            client_id = %self.client_id,
            %kind,
            sequence,
            "enqueued action"
        );
        Ok(sequence)
    }

    /// Waits for the next action in ledger order.
    ///
    /// Concurrent callers each receive a distinct action, in the order they
    /// called.
    pub async fn dequeue(&self) -> Result<Action, ProtocolError> {
        Ok(self.dequeue_entry().await?.envelope.action)
    }

    pub async fn dequeue_entry(&self) -> Result<LedgerEntry, ProtocolError> {
        match self.inbox.pop().await {
            Ok(entry) => Ok(entry),
            Err(_) => match self.inbox.failure() {
                Some(violation) => Err(ProtocolError::PeerViolation(violation)),
                None => Err(QueueError::Closed.into()),
            },
        }
    }

    /// Ledger sequence of the next action this queue will deliver.
    pub fn cursor(&self) -> LedgerSequence {
        self.inbox.cursor()
    }

    pub fn buffered(&self) -> usize {
        self.inbox.len()
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        self.pump.abort();
        self.inbox.close();
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("client_id", &self.client_id)
            .field("inbox", &self.inbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::messages::ActionPayload;
    use crate::ledger::transport::InMemoryLedger;
    use std::time::Duration;
    use tokio::runtime::Runtime;

    fn sample_entry(sequence: LedgerSequence) -> LedgerEntry {
        LedgerEntry {
            sequence,
            envelope: Envelope::unsigned(Action::new(
                ClientId::new("peer"),
                ActionPayload::DrawRequest {
                    position: sequence as usize,
                },
            )),
        }
    }

    fn draw(sender: &str, position: usize) -> Action {
        Action::new(ClientId::new(sender), ActionPayload::DrawRequest { position })
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let inbox = FifoInbox::new(0);
        inbox.push(sample_entry(1)).unwrap();
        inbox.push(sample_entry(2)).unwrap();
        inbox.push(sample_entry(3)).unwrap();

        let rt = Runtime::new().unwrap();
        let a = rt.block_on(inbox.pop()).unwrap();
        let b = rt.block_on(inbox.pop()).unwrap();
        let c = rt.block_on(inbox.pop()).unwrap();

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(c.sequence, 3);
        assert_eq!(inbox.cursor(), 4);
    }

    #[test]
    fn pop_before_push_completes_when_item_arrives() {
        let inbox = FifoInbox::new(0);
        let rx = inbox.pop();
        inbox.push(sample_entry(7)).unwrap();
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(rx).unwrap().sequence, 7);
    }

    #[test]
    fn waiters_are_served_in_arrival_order_with_distinct_items() {
        let inbox = FifoInbox::new(0);
        let first = inbox.pop();
        let second = inbox.pop();
        inbox.push(sample_entry(0)).unwrap();
        inbox.push(sample_entry(1)).unwrap();
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(first).unwrap().sequence, 0);
        assert_eq!(rt.block_on(second).unwrap().sequence, 1);
    }

    #[test]
    fn dropped_waiters_do_not_swallow_items() {
        let inbox = FifoInbox::new(0);
        drop(inbox.pop());
        inbox.push(sample_entry(5)).unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn abandoned_pop_hands_its_item_back() {
        let inbox = FifoInbox::new(0);
        let pending = inbox.pop();
        inbox.push(sample_entry(4)).unwrap();
        inbox.push(sample_entry(5)).unwrap();
        assert_eq!(inbox.len(), 1);

        drop(pending);
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.cursor(), 0);

        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(inbox.pop()).unwrap().sequence, 4);
        assert_eq!(inbox.cursor(), 5);
        assert_eq!(rt.block_on(inbox.pop()).unwrap().sequence, 5);
    }

    #[test]
    fn failure_still_hands_out_buffered_items() {
        let inbox = FifoInbox::new(0);
        inbox.push(sample_entry(0)).unwrap();
        inbox.fail(Violation::UnknownSender(ClientId::new("mallory")));
        assert!(inbox.push(sample_entry(1)).is_err());

        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(inbox.pop()).unwrap().sequence, 0);
        assert!(rt.block_on(inbox.pop()).is_err());
        assert!(inbox.failure().is_some());
    }

    #[test]
    fn outstanding_waiters_receive_error_when_closed() {
        let inbox = FifoInbox::new(0);
        let rx = inbox.pop();
        inbox.close();
        let rt = Runtime::new().unwrap();
        assert!(rt.block_on(rx).is_err());
        assert!(matches!(inbox.push(sample_entry(0)), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn queue_delivers_history_then_live_actions() {
        let ledger = InMemoryLedger::new();
        let writer = ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap();
        writer.enqueue(draw("a", 0)).await.unwrap();
        writer.enqueue(draw("a", 1)).await.unwrap();

        let late = ActionQueue::attach(ClientId::new("b"), ledger.clone()).unwrap();
        writer.enqueue(draw("a", 2)).await.unwrap();

        for expected in 0..3 {
            let action = late.dequeue().await.unwrap();
            assert_eq!(action, draw("a", expected));
        }
        assert_eq!(late.cursor(), 3);
    }

    #[tokio::test]
    async fn all_parties_observe_the_same_order() {
        let ledger = InMemoryLedger::new();
        let alice = ActionQueue::attach(ClientId::new("alice"), ledger.clone()).unwrap();
        let bob = ActionQueue::attach(ClientId::new("bob"), ledger.clone()).unwrap();

        let post_alice = async {
            for i in 0..10 {
                alice.enqueue(draw("alice", i)).await.unwrap();
                tokio::task::yield_now().await;
            }
        };
        let post_bob = async {
            for i in 0..10 {
                bob.enqueue(draw("bob", i)).await.unwrap();
                tokio::task::yield_now().await;
            }
        };
        tokio::join!(post_alice, post_bob);

        let mut seen_by_alice = Vec::new();
        let mut seen_by_bob = Vec::new();
        for _ in 0..20 {
            seen_by_alice.push(alice.dequeue().await.unwrap());
            seen_by_bob.push(bob.dequeue().await.unwrap());
        }
        assert_eq!(seen_by_alice, seen_by_bob);
    }

    #[tokio::test]
    async fn concurrent_dequeuers_receive_distinct_actions() {
        let ledger = InMemoryLedger::new();
        let queue = Arc::new(ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.dequeue().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..4 {
            queue.enqueue(draw("a", i)).await.unwrap();
        }

        let mut positions = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap().payload {
                ActionPayload::DrawRequest { position } => positions.push(position),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        positions.sort_unstable();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_ledger_drains_buffer_then_reports_closed() {
        let ledger = InMemoryLedger::new();
        let queue = ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap();
        queue.enqueue(draw("a", 0)).await.unwrap();
        ledger.close();

        assert_eq!(queue.dequeue().await.unwrap(), draw("a", 0));
        let err = queue.dequeue().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Queue(QueueError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cursor_is_past_every_returned_action() {
        for position in 0..200 {
            let ledger = InMemoryLedger::new();
            let queue = ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap();
            let poster = {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .post(Envelope::unsigned(draw("b", position)))
                        .await
                        .unwrap()
                })
            };
            let entry = queue.dequeue_entry().await.unwrap();
            assert_eq!(queue.cursor(), entry.sequence + 1);
            poster.await.unwrap();
        }
    }

    #[tokio::test]
    async fn abandoned_dequeue_keeps_the_action() {
        let ledger = InMemoryLedger::new();
        let queue = ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap();
        {
            let mut pending = Box::pin(queue.dequeue());
            assert!(futures::poll!(&mut pending).is_pending());
            queue.enqueue(draw("a", 0)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.cursor(), 0);

        assert_eq!(queue.dequeue().await.unwrap(), draw("a", 0));
        assert_eq!(queue.cursor(), 1);
    }

    #[tokio::test]
    async fn attach_at_resumes_from_cursor() {
        let ledger = InMemoryLedger::new();
        let first = ActionQueue::attach(ClientId::new("a"), ledger.clone()).unwrap();
        for i in 0..3 {
            first.enqueue(draw("a", i)).await.unwrap();
        }
        first.dequeue().await.unwrap();
        let cursor = first.cursor();
        drop(first);

        let resumed = ActionQueue::attach_at(ClientId::new("a"), ledger.clone(), cursor).unwrap();
        assert_eq!(resumed.dequeue().await.unwrap(), draw("a", 1));
    }
}
