// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rendezvous broker.
//!
//! A single task owns the [`RendezvousTables`] and applies [`Event`]s one at
//! a time. Handlers never touch the tables: they submit an event carrying a
//! one-shot sender and wait on the matching receiver. The loop is the only
//! writer of that sender; the handler only reads after it fired.

use axum::body::Body;
use log::debug;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout_at};

use crate::protocol::{ExchangeId, ForwardedRequest, PostedResponse};
use crate::tables::{Keyed, RendezvousTables, TableCounts};

/// A public request waiting for an agent poll.
#[derive(Debug)]
pub struct Producer {
    request: ForwardedRequest<Body>,
    matched: oneshot::Sender<()>,
}

impl Producer {
    pub fn new(request: ForwardedRequest<Body>) -> (Self, oneshot::Receiver<()>) {
        let (matched, rx) = oneshot::channel();
        (Self { request, matched }, rx)
    }
}

/// An agent poll waiting for a request.
#[derive(Debug)]
pub struct Consumer {
    id: ExchangeId,
    deliver: oneshot::Sender<ForwardedRequest<Body>>,
}

impl Consumer {
    pub fn new(id: ExchangeId) -> (Self, oneshot::Receiver<ForwardedRequest<Body>>) {
        let (deliver, rx) = oneshot::channel();
        (Self { id, deliver }, rx)
    }
}

/// An agent response waiting for its caller.
#[derive(Debug)]
pub struct Responder {
    id: ExchangeId,
    response: PostedResponse,
    delivered: oneshot::Sender<()>,
}

impl Responder {
    pub fn new(id: ExchangeId, response: PostedResponse) -> (Self, oneshot::Receiver<()>) {
        let (delivered, rx) = oneshot::channel();
        (Self { id, response, delivered }, rx)
    }
}

/// A public request that handed off its data and waits for the response.
#[derive(Debug)]
pub struct WaitingForResponse {
    id: ExchangeId,
    deliver: oneshot::Sender<PostedResponse>,
}

impl WaitingForResponse {
    pub fn new(id: ExchangeId) -> (Self, oneshot::Receiver<PostedResponse>) {
        let (deliver, rx) = oneshot::channel();
        (Self { id, deliver }, rx)
    }
}

impl Keyed for Producer {
    fn id(&self) -> &ExchangeId {
        &self.request.id
    }
}

impl Keyed for Consumer {
    fn id(&self) -> &ExchangeId {
        &self.id
    }
}

impl Keyed for Responder {
    fn id(&self) -> &ExchangeId {
        &self.id
    }
}

impl Keyed for WaitingForResponse {
    fn id(&self) -> &ExchangeId {
        &self.id
    }
}

type Tables = RendezvousTables<Producer, Consumer, Responder, WaitingForResponse>;

#[derive(Debug)]
pub enum Event {
    ProducerArrived { subdomain: String, producer: Producer },
    ConsumerArrived { subdomain: String, consumer: Consumer },
    ProducerLeave { subdomain: String, id: ExchangeId },
    ConsumerLeave { subdomain: String, id: ExchangeId },
    HandoffDone { waiting: WaitingForResponse },
    ResponsePosted { responder: Responder },
    ResponseLeave { id: ExchangeId },
    ConsumerGone { id: ExchangeId },
}

enum Stage1 {
    Producer(Producer),
    Consumer(Consumer),
}

enum HandOff {
    Delivered(ExchangeId),
    /// The counterpart was already gone; this side goes back in.
    Retry(Stage1),
    Abandoned,
}

fn hand_off(producer: Producer, consumer: Consumer) -> HandOff {
    if producer.matched.is_closed() {
        return if consumer.deliver.is_closed() {
            HandOff::Abandoned
        } else {
            HandOff::Retry(Stage1::Consumer(consumer))
        };
    }

    let Producer { request, matched } = producer;
    let id = request.id.clone();
    match consumer.deliver.send(request) {
        Ok(()) => {
            // The caller's deadline can fire between the check above and
            // this send. The agent then answers a caller that already got a
            // 504, and that answer dangles until the agent's own post times
            // out.
            if matched.send(()).is_err() {
                debug!("request {id} reached an agent after its caller timed out");
            }
            HandOff::Delivered(id)
        }
        Err(request) => HandOff::Retry(Stage1::Producer(Producer { request, matched })),
    }
}

/// Owns the tables. Drive it with [`EventLoop::run`].
pub struct EventLoop {
    events: mpsc::UnboundedReceiver<Event>,
    tables: Tables,
    counts: watch::Sender<TableCounts>,
}

impl EventLoop {
    /// Returns once every [`Broker`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!("broker event loop stopped");
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::ProducerArrived { subdomain, producer } => {
                self.stage1(&subdomain, Stage1::Producer(producer));
            }
            Event::ConsumerArrived { subdomain, consumer } => {
                self.stage1(&subdomain, Stage1::Consumer(consumer));
            }
            Event::ProducerLeave { subdomain, id } => {
                if self.tables.remove_producer(&subdomain, &id).is_some() {
                    debug!("[{subdomain}] request {id} left unclaimed");
                }
            }
            Event::ConsumerLeave { subdomain, id } => {
                self.tables.remove_consumer(&subdomain, &id);
            }
            Event::HandoffDone { waiting } => {
                if let Some((responder, waiting)) = self.tables.insert_waiting(waiting) {
                    self.stage2(responder, waiting);
                }
            }
            Event::ResponsePosted { responder } => {
                if let Some((responder, waiting)) = self.tables.insert_responder(responder) {
                    self.stage2(responder, waiting);
                }
            }
            Event::ResponseLeave { id } => {
                self.tables.remove_responder(&id);
            }
            Event::ConsumerGone { id } => {
                if self.tables.remove_waiting(&id).is_some() {
                    debug!("caller of {id} left before the response");
                }
            }
        }

        self.publish();
    }

    pub fn counts(&self) -> TableCounts {
        self.tables.counts()
    }

    fn publish(&self) {
        let now = self.tables.counts();
        self.counts.send_if_modified(|published| {
            if *published == now {
                return false;
            }
            *published = now;
            true
        });
    }

    fn stage1(&mut self, subdomain: &str, mut waiter: Stage1) {
        loop {
            let pair = match waiter {
                Stage1::Producer(p) => self.tables.insert_producer(subdomain, p),
                Stage1::Consumer(c) => self.tables.insert_consumer(subdomain, c),
            };
            let Some((producer, consumer)) = pair else {
                return;
            };
            match hand_off(producer, consumer) {
                HandOff::Delivered(id) => {
                    debug!("[{subdomain}] request {id} handed to an agent");
                    return;
                }
                HandOff::Retry(survivor) => waiter = survivor,
                HandOff::Abandoned => return,
            }
        }
    }

    fn stage2(&mut self, responder: Responder, waiting: WaitingForResponse) {
        let Responder { id, response, delivered } = responder;
        match waiting.deliver.send(response) {
            Ok(()) => {
                let _ = delivered.send(());
                debug!("response for {id} delivered");
            }
            Err(response) => {
                // Caller is gone: the response stays until its responder leaves.
                let responder = Responder { id, response, delivered };
                if let Some((responder, waiting)) = self.tables.insert_responder(responder) {
                    self.stage2(responder, waiting);
                }
            }
        }
    }
}

/// Cloneable handle used by HTTP handlers.
#[derive(Clone)]
pub struct Broker {
    events: mpsc::UnboundedSender<Event>,
    counts: watch::Receiver<TableCounts>,
}

impl Broker {
    pub fn new() -> (Self, EventLoop) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (counts_tx, counts_rx) = watch::channel(TableCounts::default());
        let broker = Self { events: events_tx, counts: counts_rx };
        let event_loop = EventLoop {
            events: events_rx,
            tables: Tables::new(),
            counts: counts_tx,
        };
        (broker, event_loop)
    }

    /// Starts the event loop on the current runtime.
    pub fn spawn() -> Self {
        let (broker, event_loop) = Self::new();
        tokio::spawn(event_loop.run());
        broker
    }

    /// Returns false when the event loop has stopped.
    pub fn submit(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// Table sizes as of the last processed event.
    pub fn counts(&self) -> TableCounts {
        *self.counts.borrow()
    }

    pub fn watch_counts(&self) -> watch::Receiver<TableCounts> {
        self.counts.clone()
    }

    /// Submits `event` when dropped, unless disarmed first.
    pub fn leave_guard(&self, event: Event) -> LeaveGuard {
        LeaveGuard { events: self.events.clone(), event: Some(event) }
    }
}

/// Sends the cleanup event of a waiter whose handler ends early, including
/// when the handler future is dropped on disconnect.
pub struct LeaveGuard {
    events: mpsc::UnboundedSender<Event>,
    event: Option<Event>,
}

impl LeaveGuard {
    pub fn disarm(mut self) {
        self.event = None;
    }
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            let _ = self.events.send(event);
        }
    }
}

/// Outcome of waiting on a one-shot handle.
#[derive(Debug, PartialEq, Eq)]
pub enum Wake<T> {
    Ready(T),
    TimedOut,
    /// The sending side was dropped without a value.
    Closed,
}

/// Waits for `rx` until `deadline`. On timeout the handle is closed and
/// read once more, so a value sent right at the deadline is still returned.
pub async fn wait_until<T>(mut rx: oneshot::Receiver<T>, deadline: Instant) -> Wake<T> {
    let outcome = timeout_at(deadline, &mut rx).await;
    match outcome {
        Ok(Ok(value)) => Wake::Ready(value),
        Ok(Err(_)) => Wake::Closed,
        Err(_) => {
            rx.close();
            match rx.try_recv() {
                Ok(value) => Wake::Ready(value),
                Err(_) => Wake::TimedOut,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;

    fn request(id: &str) -> ForwardedRequest<Body> {
        ForwardedRequest {
            id: ExchangeId::from(id),
            method: Method::GET,
            url: format!("/{id}"),
            host: "a.relay.test".to_string(),
            headers: HeaderMap::new(),
            body: Body::from("data"),
        }
    }

    fn response(body: &'static str) -> PostedResponse {
        PostedResponse::new(StatusCode::OK, HeaderMap::new(), body)
    }

    fn produce(lp: &mut EventLoop, subdomain: &str, id: &str) -> oneshot::Receiver<()> {
        let (producer, rx) = Producer::new(request(id));
        lp.handle(Event::ProducerArrived { subdomain: subdomain.to_string(), producer });
        rx
    }

    fn consume(
        lp: &mut EventLoop,
        subdomain: &str,
        id: &str,
    ) -> oneshot::Receiver<ForwardedRequest<Body>> {
        let (consumer, rx) = Consumer::new(ExchangeId::from(id));
        lp.handle(Event::ConsumerArrived { subdomain: subdomain.to_string(), consumer });
        rx
    }

    #[test]
    fn waiting_producer_is_claimed_by_a_poll() {
        let (_broker, mut lp) = Broker::new();
        let mut matched = produce(&mut lp, "a", "p1");
        assert_eq!(lp.counts().stage1_waitlist, 1);
        assert!(matched.try_recv().is_err());

        let mut polled = consume(&mut lp, "a", "c1");
        assert_eq!(polled.try_recv().unwrap().id.as_str(), "p1");
        assert!(matched.try_recv().is_ok());
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn waiting_poll_is_woken_by_a_request() {
        let (_broker, mut lp) = Broker::new();
        let mut polled = consume(&mut lp, "a", "c1");
        let mut other = consume(&mut lp, "b", "c2");
        assert_eq!(lp.counts().stage1_consumers, 2);

        let mut matched = produce(&mut lp, "a", "p1");
        assert_eq!(polled.try_recv().unwrap().url, "/p1");
        assert!(matched.try_recv().is_ok());
        assert!(other.try_recv().is_err());
        assert_eq!(lp.counts().stage1_consumers, 1);
    }

    #[test]
    fn closed_poll_is_skipped() {
        let (_broker, mut lp) = Broker::new();
        drop(consume(&mut lp, "a", "gone"));

        let mut matched = produce(&mut lp, "a", "p1");
        assert!(matched.try_recv().is_err());
        assert_eq!(
            lp.counts(),
            TableCounts { stage1_waitlist: 1, ..TableCounts::default() }
        );

        let mut polled = consume(&mut lp, "a", "c2");
        assert_eq!(polled.try_recv().unwrap().id.as_str(), "p1");
        assert!(matched.try_recv().is_ok());
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn closed_request_puts_the_poll_back() {
        let (_broker, mut lp) = Broker::new();
        drop(produce(&mut lp, "a", "gone"));

        let mut polled = consume(&mut lp, "a", "c1");
        assert!(polled.try_recv().is_err());
        assert_eq!(
            lp.counts(),
            TableCounts { stage1_consumers: 1, ..TableCounts::default() }
        );
    }

    #[test]
    fn leave_events_are_idempotent() {
        let (_broker, mut lp) = Broker::new();
        let _matched = produce(&mut lp, "a", "p1");
        for _ in 0..2 {
            lp.handle(Event::ProducerLeave { subdomain: "a".into(), id: ExchangeId::from("p1") });
        }
        lp.handle(Event::ConsumerLeave { subdomain: "x".into(), id: ExchangeId::from("none") });
        lp.handle(Event::ResponseLeave { id: ExchangeId::from("none") });
        lp.handle(Event::ConsumerGone { id: ExchangeId::from("none") });
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn response_posted_before_the_caller_is_ready() {
        let (_broker, mut lp) = Broker::new();
        let (responder, mut delivered) = Responder::new(ExchangeId::from("x"), response("test"));
        lp.handle(Event::ResponsePosted { responder });
        assert_eq!(lp.counts().stage2_waitlist, 1);

        let (waiting, mut got) = WaitingForResponse::new(ExchangeId::from("x"));
        lp.handle(Event::HandoffDone { waiting });
        assert_eq!(got.try_recv().unwrap().body, Bytes::from_static(b"test"));
        assert!(delivered.try_recv().is_ok());
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn caller_waiting_for_a_response() {
        let (_broker, mut lp) = Broker::new();
        let (waiting, mut got) = WaitingForResponse::new(ExchangeId::from("x"));
        lp.handle(Event::HandoffDone { waiting });
        assert_eq!(lp.counts().stage2_consumers, 1);

        let (responder, mut delivered) = Responder::new(ExchangeId::from("x"), response("ok"));
        lp.handle(Event::ResponsePosted { responder });
        assert!(got.try_recv().is_ok());
        assert!(delivered.try_recv().is_ok());
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn unclaimed_response_dangles_until_its_responder_leaves() {
        let (_broker, mut lp) = Broker::new();
        let (responder, mut delivered) = Responder::new(ExchangeId::from("orphan"), response("x"));
        lp.handle(Event::ResponsePosted { responder });

        // Unrelated traffic never expires it.
        for i in 0..10 {
            let id = format!("p{i}");
            let _m = produce(&mut lp, "a", &id);
            lp.handle(Event::ProducerLeave { subdomain: "a".into(), id: ExchangeId::from(id.as_str()) });
        }
        assert_eq!(lp.counts().stage2_waitlist, 1);
        assert!(delivered.try_recv().is_err());

        lp.handle(Event::ResponseLeave { id: ExchangeId::from("orphan") });
        assert!(lp.counts().is_empty());
    }

    #[test]
    fn response_for_a_departed_caller_dangles() {
        let (_broker, mut lp) = Broker::new();
        let (waiting, got) = WaitingForResponse::new(ExchangeId::from("x"));
        lp.handle(Event::HandoffDone { waiting });
        drop(got);

        let (responder, mut delivered) = Responder::new(ExchangeId::from("x"), response("late"));
        lp.handle(Event::ResponsePosted { responder });
        assert!(delivered.try_recv().is_err());
        assert_eq!(
            lp.counts(),
            TableCounts { stage2_waitlist: 1, ..TableCounts::default() }
        );
    }

    #[test]
    fn guard_sends_its_event_unless_disarmed() {
        let (broker, mut lp) = Broker::new();
        let _matched = produce(&mut lp, "a", "p1");

        broker
            .leave_guard(Event::ConsumerGone { id: ExchangeId::from("p1") })
            .disarm();
        drop(broker.leave_guard(Event::ProducerLeave {
            subdomain: "a".into(),
            id: ExchangeId::from("p1"),
        }));

        let event = lp.events.try_recv().unwrap();
        assert!(matches!(event, Event::ProducerLeave { .. }));
        assert!(lp.events.try_recv().is_err());
        lp.handle(event);
        assert!(lp.counts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_times_out() {
        let (_tx, rx) = oneshot::channel::<u8>();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(wait_until(rx, deadline).await, Wake::TimedOut);

        let (tx, rx) = oneshot::channel::<u8>();
        tx.send(7).unwrap();
        assert_eq!(wait_until(rx, deadline).await, Wake::Ready(7));

        let (tx, rx) = oneshot::channel::<u8>();
        drop(tx);
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(wait_until(rx, deadline).await, Wake::Closed);
    }

    #[tokio::test]
    async fn spawned_loop_publishes_counts() {
        let broker = Broker::spawn();
        let mut counts = broker.watch_counts();
        let (consumer, _rx) = Consumer::new(ExchangeId::from("c1"));
        assert!(broker.submit(Event::ConsumerArrived { subdomain: "a".into(), consumer }));

        counts.changed().await.unwrap();
        assert_eq!(broker.counts().stage1_consumers, 1);

        broker.submit(Event::ConsumerLeave { subdomain: "a".into(), id: ExchangeId::from("c1") });
        counts.changed().await.unwrap();
        assert!(broker.counts().is_empty());
    }
}
