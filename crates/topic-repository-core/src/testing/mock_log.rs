//! In-memory partitioned log for testing.
//!
//! [`MockLogCluster`] implements [`LogClient`] over shared in-memory state.
//! Faults can be injected per partition:
//! - stalled partitions never acknowledge a send
//! - failing partitions reject sends with a broker error
//! - timing-out partitions resolve sends to [`LogError::Timeout`]
//! - delayed partitions acknowledge after a fixed delay
//!
//! Producer metadata lookups can also be made to time out.
//!
//! Every connection open and close is counted so tests can assert on pool
//! behavior.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, FutureExt};

use crate::error::{LogError, LogResult};
use crate::log::{
    ConsumerConnection, LogClient, LogRecord, NewTopic, PartitionInfo, ProducerConnection,
    SendHandle, TopicAdmin, TopicPartition,
};

/// Leader assigned to partitions created without an explicit leader.
pub const DEFAULT_LEADER: i32 = 1;

#[derive(Debug, Clone)]
struct PartitionLog {
    leader: Option<i32>,
    log_start: i64,
    end: i64,
    records: Vec<Bytes>,
}

impl PartitionLog {
    fn new(leader: Option<i32>) -> Self {
        Self {
            leader,
            log_start: 0,
            end: 0,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SendFault {
    Stall,
    Timeout,
    Delay(Duration),
}

#[derive(Default)]
struct ClusterState {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    unavailable: bool,
    admin_unavailable: bool,
    metadata_timeout: bool,
    faults: HashMap<(String, i32), SendFault>,
    failures: HashMap<(String, i32), String>,
    producer_flags: Vec<Arc<AtomicBool>>,
    producers_opened: usize,
    producers_closed: usize,
    consumers_opened: usize,
    consumers_closed: usize,
    admins_opened: usize,
    admins_closed: usize,
    last_connection_string: Option<String>,
    created: Vec<NewTopic>,
    deleted: Vec<String>,
}

impl ClusterState {
    fn check_available(&self) -> LogResult<()> {
        if self.unavailable {
            Err(LogError::NoBrokersAvailable)
        } else {
            Ok(())
        }
    }

    fn partitions_for(&self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        self.check_available()?;
        let partitions = self
            .topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(index, log)| PartitionInfo {
                topic: topic.to_string(),
                partition: index as i32,
                leader: log.leader,
            })
            .collect())
    }

    fn partition(&self, tp: &TopicPartition) -> LogResult<&PartitionLog> {
        usize::try_from(tp.partition)
            .ok()
            .and_then(|index| self.topics.get(&tp.topic)?.get(index))
            .ok_or_else(|| LogError::UnknownPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> &mut PartitionLog {
        let index = usize::try_from(partition).expect("partition index is non-negative");
        let logs = self
            .topics
            .get_mut(topic)
            .unwrap_or_else(|| panic!("unknown topic {topic}"));
        &mut logs[index]
    }
}

/// In-memory cluster. Clones share state.
#[derive(Clone, Default)]
pub struct MockLogCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockLogCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty topic whose partitions are led by [`DEFAULT_LEADER`].
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.create_topic_with_leaders(topic, &vec![Some(DEFAULT_LEADER); partitions]);
    }

    /// Create an empty topic with one partition per leader entry.
    pub fn create_topic_with_leaders(&self, topic: &str, leaders: &[Option<i32>]) {
        self.lock().topics.insert(
            topic.to_string(),
            leaders.iter().map(|leader| PartitionLog::new(*leader)).collect(),
        );
    }

    /// Set the retained range of a partition: `oldest` is the first retained
    /// offset and `end` the next offset to be written.
    pub fn set_offsets(&self, topic: &str, partition: i32, oldest: i64, end: i64) {
        let mut state = self.lock();
        let log = state.partition_mut(topic, partition);
        log.log_start = oldest;
        log.end = end;
        log.records.clear();
    }

    /// Append records and return the offset of the first.
    pub fn append(&self, topic: &str, partition: i32, events: &[&str]) -> i64 {
        let mut state = self.lock();
        let log = state.partition_mut(topic, partition);
        let base = log.end;
        for event in events {
            log.records.push(Bytes::copy_from_slice(event.as_bytes()));
            log.end += 1;
        }
        base
    }

    /// Records appended to a partition.
    #[must_use]
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Bytes> {
        let state = self.lock();
        usize::try_from(partition)
            .ok()
            .and_then(|index| state.topics.get(topic)?.get(index))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Sends to this partition never complete.
    pub fn stall_partition(&self, topic: &str, partition: i32) {
        self.lock()
            .faults
            .insert((topic.to_string(), partition), SendFault::Stall);
    }

    /// Sends to this partition resolve to a timeout failure.
    pub fn timeout_partition(&self, topic: &str, partition: i32) {
        self.lock()
            .faults
            .insert((topic.to_string(), partition), SendFault::Timeout);
    }

    /// Sends to this partition are acknowledged after `delay`.
    pub fn delay_partition(&self, topic: &str, partition: i32, delay: Duration) {
        self.lock()
            .faults
            .insert((topic.to_string(), partition), SendFault::Delay(delay));
    }

    /// Sends to this partition fail with a broker error carrying `message`.
    pub fn fail_partition(&self, topic: &str, partition: i32, message: &str) {
        self.lock()
            .failures
            .insert((topic.to_string(), partition), message.to_string());
    }

    /// Remove every injected send fault.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.failures.clear();
        state.metadata_timeout = false;
    }

    /// Producer partition lookups fail with a timeout.
    pub fn timeout_metadata(&self, enabled: bool) {
        self.lock().metadata_timeout = enabled;
    }

    /// Make every client operation fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make admin sessions fail to open.
    pub fn set_admin_unavailable(&self, unavailable: bool) {
        self.lock().admin_unavailable = unavailable;
    }

    /// Break every open producer connection.
    pub fn close_all_producers(&self) {
        for flag in &self.lock().producer_flags {
            flag.store(true, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn producers_opened(&self) -> usize {
        self.lock().producers_opened
    }

    #[must_use]
    pub fn producers_closed(&self) -> usize {
        self.lock().producers_closed
    }

    #[must_use]
    pub fn consumers_opened(&self) -> usize {
        self.lock().consumers_opened
    }

    #[must_use]
    pub fn consumers_closed(&self) -> usize {
        self.lock().consumers_closed
    }

    #[must_use]
    pub fn admins_opened(&self) -> usize {
        self.lock().admins_opened
    }

    #[must_use]
    pub fn admins_closed(&self) -> usize {
        self.lock().admins_closed
    }

    /// Connection string of the most recent admin session.
    #[must_use]
    pub fn last_connection_string(&self) -> Option<String> {
        self.lock().last_connection_string.clone()
    }

    /// Topics created through admin sessions.
    #[must_use]
    pub fn created_topics(&self) -> Vec<NewTopic> {
        self.lock().created.clone()
    }

    /// Topics deleted through admin sessions.
    #[must_use]
    pub fn deleted_topics(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }
}

#[async_trait]
impl LogClient for MockLogCluster {
    type Producer = MockProducer;
    type Consumer = MockConsumer;
    type Admin = MockAdmin;

    async fn list_topics(&self) -> LogResult<Vec<String>> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.topics.keys().cloned().collect())
    }

    async fn open_producer(&self) -> LogResult<MockProducer> {
        let mut state = self.lock();
        state.check_available()?;
        state.producers_opened += 1;
        let closed = Arc::new(AtomicBool::new(false));
        state.producer_flags.push(Arc::clone(&closed));
        Ok(MockProducer {
            state: Arc::clone(&self.state),
            closed,
        })
    }

    async fn open_consumer(&self) -> LogResult<MockConsumer> {
        let mut state = self.lock();
        state.check_available()?;
        state.consumers_opened += 1;
        Ok(MockConsumer {
            state: Arc::clone(&self.state),
            assignment: HashSet::new(),
            seeks: HashMap::new(),
            closed: false,
        })
    }

    async fn open_admin(&self, connection_string: &str) -> LogResult<MockAdmin> {
        let mut state = self.lock();
        state.last_connection_string = Some(connection_string.to_string());
        state.check_available()?;
        if state.admin_unavailable {
            return Err(LogError::BrokerUnavailable {
                broker_id: -1,
                message: format!("cannot reach controller via {connection_string}"),
            });
        }
        state.admins_opened += 1;
        Ok(MockAdmin {
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

/// Producer over a [`MockLogCluster`].
pub struct MockProducer {
    state: Arc<Mutex<ClusterState>>,
    closed: Arc<AtomicBool>,
}

impl MockProducer {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProducerConnection for MockProducer {
    async fn partitions_for(&self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }
        let state = self.lock();
        if state.metadata_timeout {
            return Err(LogError::Timeout(format!("metadata of {topic}")));
        }
        state.partitions_for(topic)
    }

    fn send(&self, record: LogRecord) -> SendHandle {
        if self.closed.load(Ordering::SeqCst) {
            return future::ready(Err(LogError::Closed)).boxed();
        }

        let mut state = self.lock();
        if let Err(e) = state.check_available() {
            return future::ready(Err(e)).boxed();
        }

        let key = (record.topic.clone(), record.partition);
        if let Some(message) = state.failures.get(&key) {
            let error = LogError::Broker {
                code: 6,
                message: message.clone(),
            };
            return future::ready(Err(error)).boxed();
        }

        let fault = state.faults.get(&key).copied();
        match fault {
            Some(SendFault::Stall) => return future::pending().boxed(),
            Some(SendFault::Timeout) => {
                let error = LogError::Timeout(format!("produce to {}-{}", key.0, key.1));
                return future::ready(Err(error)).boxed();
            }
            Some(SendFault::Delay(_)) | None => {}
        }

        let tp = TopicPartition::new(record.topic, record.partition);
        if let Err(e) = state.partition(&tp) {
            return future::ready(Err(e)).boxed();
        }
        let log = state.partition_mut(&tp.topic, tp.partition);
        let offset = log.end;
        log.records.push(record.value);
        log.end += 1;

        match fault {
            Some(SendFault::Delay(delay)) => async move {
                tokio::time::sleep(delay).await;
                Ok(offset)
            }
            .boxed(),
            _ => future::ready(Ok(offset)).boxed(),
        }
    }

    fn is_usable(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.lock().producers_closed += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Seek {
    Beginning,
    End,
}

/// Consumer over a [`MockLogCluster`].
pub struct MockConsumer {
    state: Arc<Mutex<ClusterState>>,
    assignment: HashSet<TopicPartition>,
    seeks: HashMap<TopicPartition, Seek>,
    closed: bool,
}

impl MockConsumer {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConsumerConnection for MockConsumer {
    async fn list_topics(&mut self) -> LogResult<Vec<(String, Vec<PartitionInfo>)>> {
        let state = self.lock();
        state.check_available()?;
        state
            .topics
            .keys()
            .map(|topic| -> LogResult<(String, Vec<PartitionInfo>)> {
                Ok((topic.clone(), state.partitions_for(topic)?))
            })
            .collect()
    }

    async fn partitions_for(&mut self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        self.lock().partitions_for(topic)
    }

    fn assign(&mut self, partitions: Vec<TopicPartition>) {
        self.assignment = partitions.into_iter().collect();
        self.seeks.retain(|tp, _| self.assignment.contains(tp));
    }

    fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.seeks.insert(tp.clone(), Seek::Beginning);
        }
    }

    fn seek_to_end(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.seeks.insert(tp.clone(), Seek::End);
        }
    }

    async fn position(&mut self, partition: &TopicPartition) -> LogResult<i64> {
        if !self.assignment.contains(partition) {
            return Err(LogError::NotAssigned {
                topic: partition.topic.clone(),
                partition: partition.partition,
            });
        }
        let seek = self.seeks.get(partition).copied().unwrap_or(Seek::Beginning);
        let state = self.lock();
        state.check_available()?;
        let log = state.partition(partition)?;
        Ok(match seek {
            Seek::Beginning => log.log_start,
            Seek::End => log.end,
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.lock().consumers_closed += 1;
        }
    }
}

/// Admin session over a [`MockLogCluster`].
pub struct MockAdmin {
    state: Arc<Mutex<ClusterState>>,
    closed: bool,
}

impl MockAdmin {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TopicAdmin for MockAdmin {
    async fn create_topic(&mut self, topic: &NewTopic) -> LogResult<()> {
        let mut state = self.lock();
        state.check_available()?;
        if state.topics.contains_key(&topic.name) {
            return Err(LogError::TopicAlreadyExists(topic.name.clone()));
        }
        let partitions = usize::try_from(topic.partitions).unwrap_or_default();
        state.topics.insert(
            topic.name.clone(),
            vec![PartitionLog::new(Some(DEFAULT_LEADER)); partitions],
        );
        state.created.push(topic.clone());
        Ok(())
    }

    async fn delete_topic(&mut self, name: &str) -> LogResult<()> {
        let mut state = self.lock();
        state.check_available()?;
        if state.topics.remove(name).is_none() {
            return Err(LogError::UnknownTopic(name.to_string()));
        }
        state.deleted.push(name.to_string());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.lock().admins_closed += 1;
        }
    }
}
