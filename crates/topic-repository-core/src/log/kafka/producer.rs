//! Publish-side connection.
//!
//! Sends are queued per partition. One worker task per partition resolves the
//! leader, produces a single-record batch to it and reports the assigned
//! offset, so records of a partition are appended in the order they were
//! sent. Different partitions proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{self, FutureExt};
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::ProduceRequest;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{LogError, LogResult};
use crate::log::{LogRecord, PartitionInfo, ProducerConnection, SendHandle, TopicPartition};

use super::cluster::KafkaCluster;
use super::protocol::{self, versions};

type SendJob = (LogRecord, oneshot::Sender<LogResult<i64>>);

/// Send queue of one partition and the worker draining it.
struct Lane {
    queue: mpsc::UnboundedSender<SendJob>,
    worker: AbortHandle,
}

/// Long-lived producer over its own broker connections.
pub struct KafkaProducer {
    inner: Arc<ProducerInner>,
    lanes: Mutex<HashMap<TopicPartition, Lane>>,
}

struct ProducerInner {
    cluster: KafkaCluster,
    acks: i16,
    leaders: DashMap<TopicPartition, i32>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

impl KafkaProducer {
    pub(crate) fn new(cluster: KafkaCluster, acks: i16) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                cluster,
                acks,
                leaders: DashMap::new(),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sends not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    fn open_lane(&self, tp: &TopicPartition) -> Lane {
        let (queue, mut jobs) = mpsc::unbounded_channel::<SendJob>();
        let inner = Arc::clone(&self.inner);
        let worker = tokio::spawn(async move {
            while let Some((record, reply)) = jobs.recv().await {
                let result = inner.produce(record).await;
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                // the caller may have stopped waiting
                let _ = reply.send(result);
            }
        });
        debug!(partition = %tp, "opened send lane");
        Lane {
            queue,
            worker: worker.abort_handle(),
        }
    }
}

impl ProducerInner {
    async fn refresh_leaders(&self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        let metadata = self.cluster.fetch_metadata(Some(std::slice::from_ref(&topic))).await?;
        let partitions = metadata.partitions_of(topic)?;
        for info in &partitions {
            let tp = TopicPartition::new(topic, info.partition);
            match info.leader {
                Some(leader) => {
                    self.leaders.insert(tp, leader);
                }
                None => {
                    self.leaders.remove(&tp);
                }
            }
        }
        Ok(partitions)
    }

    async fn leader_of(&self, tp: &TopicPartition) -> LogResult<i32> {
        if let Some(leader) = self.leaders.get(tp) {
            return Ok(*leader);
        }
        self.refresh_leaders(&tp.topic).await?;
        self.leaders
            .get(tp)
            .map(|leader| *leader)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    async fn produce(&self, record: LogRecord) -> LogResult<i64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        let tp = TopicPartition::new(record.topic.clone(), record.partition);
        let leader = self.leader_of(&tp).await?;
        let conn = self.cluster.broker(leader)?;

        let batch = protocol::encode_record(record.key, record.value)?;
        let timeout_ms = i32::try_from(self.cluster.settings().request_timeout.as_millis())
            .unwrap_or(i32::MAX);
        let request = ProduceRequest::default()
            .with_acks(self.acks)
            .with_timeout_ms(timeout_ms)
            .with_topic_data(vec![TopicProduceData::default()
                .with_name(protocol::topic_name(&tp.topic))
                .with_partition_data(vec![PartitionProduceData::default()
                    .with_index(tp.partition)
                    .with_records(Some(batch))])]);

        let response = conn.request(&request, versions::PRODUCE).await?;
        let partition = response
            .responses
            .iter()
            .filter(|topic| topic.name.as_str() == tp.topic)
            .flat_map(|topic| topic.partition_responses.iter())
            .find(|p| p.index == tp.partition)
            .ok_or_else(|| LogError::Protocol {
                message: format!("produce response has no entry for {tp}"),
            })?;

        if protocol::is_leadership_error(partition.error_code) {
            self.leaders.remove(&tp);
        }
        protocol::check_error(partition.error_code, partition.error_message.as_ref())?;

        debug!(partition = %tp, offset = partition.base_offset, broker_id = leader, "record acknowledged");
        Ok(partition.base_offset)
    }
}

#[async_trait]
impl ProducerConnection for KafkaProducer {
    async fn partitions_for(&self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        self.inner.refresh_leaders(topic).await
    }

    fn send(&self, record: LogRecord) -> SendHandle {
        if self.inner.closed.load(Ordering::Acquire) {
            return future::ready(Err(LogError::Closed)).boxed();
        }

        let tp = TopicPartition::new(record.topic.clone(), record.partition);
        let (reply, ack) = oneshot::channel();
        // enqueue before returning so call order is append order
        if let Ok(mut lanes) = self.lanes.lock() {
            let lane = lanes.entry(tp).or_insert_with_key(|tp| self.open_lane(tp));
            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
            if lane.queue.send((record, reply)).is_err() {
                self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }

        // a dropped reply means the lane was shut down by close
        async move { ack.await.unwrap_or(Err(LogError::Closed)) }.boxed()
    }

    fn is_usable(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && !self.inner.cluster.is_closed()
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let aborted = self.in_flight();
        if let Ok(mut lanes) = self.lanes.lock() {
            for (_, lane) in lanes.drain() {
                lane.worker.abort();
            }
        }
        if aborted > 0 {
            warn!(aborted, "producer closed with sends in flight");
        }
        self.inner.cluster.close();
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        self.close();
    }
}
