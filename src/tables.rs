// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching tables for both rendezvous stages.
//!
//! Not synchronized: the broker event loop is the only owner.

use std::collections::HashMap;

use serde::Serialize;

use crate::protocol::ExchangeId;

/// Anything that can sit in a table.
pub trait Keyed {
    fn id(&self) -> &ExchangeId;
}

/// Entry counts of the four tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub stage1_waitlist: usize,
    pub stage1_consumers: usize,
    pub stage2_waitlist: usize,
    pub stage2_consumers: usize,
}

impl TableCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// subdomain -> id -> waiter, with an exact entry count.
struct Bucketed<W> {
    buckets: HashMap<String, HashMap<ExchangeId, W>>,
    len: usize,
}

impl<W: Keyed> Bucketed<W> {
    fn new() -> Self {
        Self { buckets: HashMap::new(), len: 0 }
    }

    fn add(&mut self, subdomain: &str, waiter: W) {
        let bucket = self.buckets.entry(subdomain.to_string()).or_default();
        if bucket.insert(waiter.id().clone(), waiter).is_none() {
            self.len += 1;
        }
    }

    /// Removes whichever entry the map yields first; no arrival order.
    fn take_any(&mut self, subdomain: &str) -> Option<W> {
        let bucket = self.buckets.get_mut(subdomain)?;
        let id = bucket.keys().next()?.clone();
        let waiter = bucket.remove(&id)?;
        if bucket.is_empty() {
            self.buckets.remove(subdomain);
        }
        self.len -= 1;
        Some(waiter)
    }

    fn remove(&mut self, subdomain: &str, id: &ExchangeId) -> Option<W> {
        let bucket = self.buckets.get_mut(subdomain)?;
        let waiter = bucket.remove(id)?;
        if bucket.is_empty() {
            self.buckets.remove(subdomain);
        }
        self.len -= 1;
        Some(waiter)
    }
}

/// Stage 1 pairs producers (public requests) with consumers (agent polls)
/// per subdomain; stage 2 pairs responders (agent posts) with callers
/// waiting for a response, per exchange id.
pub struct RendezvousTables<P, C, R, W> {
    stage1_waitlist: Bucketed<P>,
    stage1_consumers: Bucketed<C>,
    stage2_waitlist: HashMap<ExchangeId, R>,
    stage2_consumers: HashMap<ExchangeId, W>,
}

impl<P: Keyed, C: Keyed, R: Keyed, W: Keyed> Default for RendezvousTables<P, C, R, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Keyed, C: Keyed, R: Keyed, W: Keyed> RendezvousTables<P, C, R, W> {
    pub fn new() -> Self {
        Self {
            stage1_waitlist: Bucketed::new(),
            stage1_consumers: Bucketed::new(),
            stage2_waitlist: HashMap::new(),
            stage2_consumers: HashMap::new(),
        }
    }

    /// Returns the producer paired with a waiting consumer, or enqueues it.
    pub fn insert_producer(&mut self, subdomain: &str, producer: P) -> Option<(P, C)> {
        match self.stage1_consumers.take_any(subdomain) {
            Some(consumer) => Some((producer, consumer)),
            None => {
                self.stage1_waitlist.add(subdomain, producer);
                None
            }
        }
    }

    /// Returns the consumer paired with a waiting producer, or enqueues it.
    pub fn insert_consumer(&mut self, subdomain: &str, consumer: C) -> Option<(P, C)> {
        match self.stage1_waitlist.take_any(subdomain) {
            Some(producer) => Some((producer, consumer)),
            None => {
                self.stage1_consumers.add(subdomain, consumer);
                None
            }
        }
    }

    pub fn remove_producer(&mut self, subdomain: &str, id: &ExchangeId) -> Option<P> {
        self.stage1_waitlist.remove(subdomain, id)
    }

    pub fn remove_consumer(&mut self, subdomain: &str, id: &ExchangeId) -> Option<C> {
        self.stage1_consumers.remove(subdomain, id)
    }

    /// A second responder for the same id replaces the first, which is
    /// dropped.
    pub fn insert_responder(&mut self, responder: R) -> Option<(R, W)> {
        match self.stage2_consumers.remove(responder.id()) {
            Some(waiting) => Some((responder, waiting)),
            None => {
                self.stage2_waitlist.insert(responder.id().clone(), responder);
                None
            }
        }
    }

    pub fn insert_waiting(&mut self, waiting: W) -> Option<(R, W)> {
        match self.stage2_waitlist.remove(waiting.id()) {
            Some(responder) => Some((responder, waiting)),
            None => {
                self.stage2_consumers.insert(waiting.id().clone(), waiting);
                None
            }
        }
    }

    pub fn remove_responder(&mut self, id: &ExchangeId) -> Option<R> {
        self.stage2_waitlist.remove(id)
    }

    pub fn remove_waiting(&mut self, id: &ExchangeId) -> Option<W> {
        self.stage2_consumers.remove(id)
    }

    pub fn counts(&self) -> TableCounts {
        TableCounts {
            stage1_waitlist: self.stage1_waitlist.len,
            stage1_consumers: self.stage1_consumers.len,
            stage2_waitlist: self.stage2_waitlist.len(),
            stage2_consumers: self.stage2_consumers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry(ExchangeId);

    impl Keyed for Entry {
        fn id(&self) -> &ExchangeId {
            &self.0
        }
    }

    fn entry(id: &str) -> Entry {
        Entry(ExchangeId::from(id))
    }

    type Tables = RendezvousTables<Entry, Entry, Entry, Entry>;

    #[test]
    fn producer_waits_until_a_consumer_arrives() {
        let mut t = Tables::new();
        assert!(t.insert_producer("a", entry("p1")).is_none());
        assert_eq!(t.counts().stage1_waitlist, 1);

        // A consumer for another subdomain does not match.
        assert!(t.insert_consumer("b", entry("c0")).is_none());

        let (p, c) = t.insert_consumer("a", entry("c1")).unwrap();
        assert_eq!(p, entry("p1"));
        assert_eq!(c, entry("c1"));
        assert_eq!(
            t.counts(),
            TableCounts { stage1_consumers: 1, ..TableCounts::default() }
        );
    }

    #[test]
    fn every_entry_is_matched_at_most_once() {
        let mut t = Tables::new();
        for i in 0..3 {
            assert!(t.insert_consumer("a", entry(&format!("c{i}"))).is_none());
        }
        let mut seen = Vec::new();
        for i in 0..3 {
            let (_, c) = t.insert_producer("a", entry(&format!("p{i}"))).unwrap();
            assert!(!seen.contains(&c.0));
            seen.push(c.0);
        }
        // All consumers are taken; the next producer waits.
        assert!(t.insert_producer("a", entry("p3")).is_none());
        assert_eq!(t.counts().stage1_consumers, 0);
        assert_eq!(t.counts().stage1_waitlist, 1);
    }

    #[test]
    fn removal_is_idempotent() {
        let mut t = Tables::new();
        t.insert_producer("a", entry("p1"));
        assert!(t.remove_producer("a", &ExchangeId::from("p1")).is_some());
        assert!(t.remove_producer("a", &ExchangeId::from("p1")).is_none());
        assert!(t.remove_consumer("zz", &ExchangeId::from("nope")).is_none());
        assert!(t.remove_responder(&ExchangeId::from("nope")).is_none());
        assert!(t.remove_waiting(&ExchangeId::from("nope")).is_none());
        assert!(t.counts().is_empty());
    }

    #[test]
    fn stage2_matches_in_either_order() {
        let mut t = Tables::new();
        assert!(t.insert_responder(entry("x")).is_none());
        assert!(t.insert_waiting(entry("y")).is_none());
        assert_eq!(t.counts().stage2_waitlist, 1);
        assert_eq!(t.counts().stage2_consumers, 1);

        assert!(t.insert_waiting(entry("x")).is_some());
        assert!(t.insert_responder(entry("y")).is_some());
        assert!(t.counts().is_empty());
    }

    #[test]
    fn duplicate_responder_replaces_the_first() {
        let mut t = Tables::new();
        t.insert_responder(entry("x"));
        t.insert_responder(entry("x"));
        assert_eq!(t.counts().stage2_waitlist, 1);
    }
}
