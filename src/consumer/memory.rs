//! In-process broker with consumer-group semantics.
//!
//! Keeps the pieces of Redis Streams the consumer relies on: append-only
//! entries with increasing ids, group cursors, per-consumer pending entries
//! and idle BLOCK reads. Failures can be injected per command, and every
//! command is journaled so tests can assert on ordering.

use crate::consumer::broker::{BrokerFactory, ReadGroupRequest, StreamBroker, StreamMessage};
use crate::consumer::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One journaled broker command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Ping,
    CreateGroup { stream: String, group: String },
    ReadGroup { stream: String, consumer: String },
    Ack { stream: String, group: String, id: String },
    /// Free-form marker written by test handlers
    Note(String),
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    /// Entry id -> consumer it was delivered to
    pending: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<(String, BTreeMap<String, String>)>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    journal: Vec<BrokerCall>,
    fetch_failures: VecDeque<BrokerError>,
    ack_failures: HashMap<String, BrokerError>,
    ping_failures: u32,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    appended: Notify,
}

/// Shared handle to an in-memory broker; clones see the same streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Empty broker with no streams
    pub fn new() -> Self {
        Self::default()
    }

    /// Append with an auto-generated `<seq>-0` id, starting at `1-0`.
    pub fn append(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let id = {
            let mut state = self.inner.state.lock();
            let log = state.streams.entry(stream.to_string()).or_default();
            log.next_seq += 1;
            let id = format!("{}-0", log.next_seq);
            log.entries.push((
                id.clone(),
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ));
            id
        };
        self.inner.appended.notify_waiters();
        id
    }

    /// Fail the next fetch with `error`; queued failures are used in order.
    pub fn fail_next_fetch(&self, error: BrokerError) {
        self.inner.state.lock().fetch_failures.push_back(error);
    }

    /// Fail the next acknowledgment of `id`
    pub fn fail_ack(&self, id: &str, error: BrokerError) {
        self.inner
            .state
            .lock()
            .ack_failures
            .insert(id.to_string(), error);
    }

    /// Fail the next `count` pings
    pub fn fail_pings(&self, count: u32) {
        self.inner.state.lock().ping_failures = count;
    }

    /// Journal a marker from outside the broker
    pub fn note(&self, text: impl Into<String>) {
        self.inner
            .state
            .lock()
            .journal
            .push(BrokerCall::Note(text.into()));
    }

    /// Every command seen so far
    pub fn journal(&self) -> Vec<BrokerCall> {
        self.inner.state.lock().journal.clone()
    }

    /// Ids acknowledged so far, in call order
    pub fn acked_ids(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Ack { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Delivered but unacknowledged entry ids
    pub fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `group` exists on `stream`
    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .is_some_and(|log| log.groups.contains_key(group))
    }

    /// Deliver up to `count` new entries, or `None` when there are none yet.
    fn try_deliver(
        &self,
        request: &ReadGroupRequest,
    ) -> Result<Option<Vec<StreamMessage>>, BrokerError> {
        let mut state = self.inner.state.lock();
        let log = state.streams.get_mut(&request.stream).ok_or_else(|| {
            BrokerError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                request.stream, request.group
            ))
        })?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let group = groups.get_mut(&request.group).ok_or_else(|| {
            BrokerError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                request.stream, request.group
            ))
        })?;

        if group.cursor >= entries.len() {
            return Ok(None);
        }

        let end = (group.cursor + request.count.max(1)).min(entries.len());
        let batch = entries[group.cursor..end]
            .iter()
            .map(|(id, fields)| {
                group.pending.insert(id.clone(), request.consumer.clone());
                StreamMessage::new(request.stream.clone(), id.clone(), fields.clone())
            })
            .collect();
        group.cursor = end;
        Ok(Some(batch))
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ping(&mut self) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.journal.push(BrokerCall::Ping);
        if state.ping_failures > 0 {
            state.ping_failures -= 1;
            return Err(BrokerError::Io("LOADING Redis is loading the dataset".into()));
        }
        Ok(())
    }

    async fn create_group(
        &mut self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.journal.push(BrokerCall::CreateGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        });

        let log = state.streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Err(BrokerError::GroupAlreadyExists(
                "BUSYGROUP Consumer Group name already exists".into(),
            ));
        }

        let cursor = match start_id {
            "0" | "0-0" => 0,
            "$" => log.entries.len(),
            id => match log.entries.iter().position(|(entry, _)| entry == id) {
                Some(index) => index + 1,
                None => {
                    return Err(BrokerError::Command(format!(
                        "ERR Invalid stream ID specified as stream command argument: {}",
                        id
                    )))
                }
            },
        };

        log.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &mut self,
        request: &ReadGroupRequest,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        {
            let mut state = self.inner.state.lock();
            state.journal.push(BrokerCall::ReadGroup {
                stream: request.stream.clone(),
                consumer: request.consumer.clone(),
            });
            if let Some(error) = state.fetch_failures.pop_front() {
                return Err(error);
            }
        }

        let deadline = tokio::time::Instant::now() + request.block;
        loop {
            // Registered before the check so an append in between still wakes us.
            let appended = self.inner.appended.notified();

            if let Some(batch) = self.try_deliver(request)? {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError> {
        let mut state = self.inner.state.lock();
        state.journal.push(BrokerCall::Ack {
            stream: stream.to_string(),
            group: group.to_string(),
            id: id.to_string(),
        });

        if let Some(error) = state.ack_failures.remove(id) {
            return Err(error);
        }

        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|g| g.pending.remove(id))
            .is_some();
        Ok(u64::from(removed))
    }
}

/// Hands out clones of a [`MemoryBroker`], refusing the first few opens.
#[derive(Debug)]
pub struct MemoryBrokerFactory {
    broker: MemoryBroker,
    refusals: AtomicU32,
    opens: AtomicU32,
}

impl MemoryBrokerFactory {
    /// Factory handing out clones of `broker`
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            refusals: AtomicU32::new(0),
            opens: AtomicU32::new(0),
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_first(self, count: u32) -> Self {
        self.refusals.store(count, Ordering::SeqCst);
        self
    }

    /// Connection attempts made so far
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerFactory for MemoryBrokerFactory {
    type Broker = MemoryBroker;

    async fn open(&self) -> Result<MemoryBroker, BrokerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Io("Connection refused (os error 111)".into()));
        }
        Ok(self.broker.clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(count: usize) -> ReadGroupRequest {
        ReadGroupRequest {
            stream: "s".into(),
            group: "g".into(),
            consumer: "c".into(),
            count,
            block: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_group_delivers_in_order_and_tracks_pending() {
        let mut broker = MemoryBroker::new();
        broker.create_group("s", "g", "0").await.unwrap();
        broker.append("s", &[("content", "a")]);
        broker.append("s", &[("content", "b")]);

        let batch = broker.read_group(&request(10)).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1-0", "2-0"]);
        assert_eq!(broker.pending("s", "g"), ["1-0", "2-0"]);

        assert_eq!(broker.ack("s", "g", "1-0").await.unwrap(), 1);
        assert_eq!(broker.ack("s", "g", "1-0").await.unwrap(), 0);
        assert_eq!(broker.pending("s", "g"), ["2-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_read_blocks_for_timeout() {
        let mut broker = MemoryBroker::new();
        broker.create_group("s", "g", "$").await.unwrap();

        let start = tokio::time::Instant::now();
        let batch = broker.read_group(&request(1)).await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_read_wakes_on_append() {
        let mut broker = MemoryBroker::new();
        broker.create_group("s", "g", "$").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            producer.append("s", &[("content", "late")]);
        });

        let batch = broker.read_group(&request(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].field("content"), Some("late"));
    }

    #[tokio::test]
    async fn test_group_start_at_latest_skips_history() {
        let mut broker = MemoryBroker::new();
        broker.append("s", &[("content", "old")]);
        broker.create_group("s", "g", "$").await.unwrap();
        broker.append("s", &[("content", "new")]);

        let batch = broker.read_group(&request(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "2-0");
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let mut broker = MemoryBroker::new();
        let err = broker.read_group(&request(1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Command(msg) if msg.starts_with("NOGROUP")));
    }
}
