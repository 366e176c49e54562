//! Connection pool for log connections.
//!
//! Publish connections are long-lived and reused across calls. Each take hands
//! out a [`PooledProducer`] guard that returns the connection on drop, or
//! evicts it when [`PooledProducer::terminate`] is called instead.
//!
//! Read and admin connections are opened per call. Their guards
//! ([`ReadConnection`], [`AdminSession`]) close the connection on drop.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{LogError, LogResult};
use crate::log::{ConsumerConnection, LogClient, ProducerConnection, TopicAdmin};

#[derive(Debug, Default)]
struct PoolCounters {
    opened: AtomicUsize,
    terminated: AtomicUsize,
    discarded: AtomicUsize,
}

/// Pool of publish connections plus a factory for per-call connections.
pub struct ConnectionPool<C: LogClient> {
    client: Arc<C>,
    max_producers: usize,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<C::Producer>>>,
    counters: Arc<PoolCounters>,
}

impl<C: LogClient> ConnectionPool<C> {
    /// Create a pool holding at most `max_producers` publish connections.
    #[must_use]
    pub fn new(client: Arc<C>, max_producers: usize) -> Self {
        let max_producers = max_producers.max(1);
        Self {
            client,
            max_producers,
            permits: Arc::new(Semaphore::new(max_producers)),
            idle: Arc::new(Mutex::new(Vec::with_capacity(max_producers))),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// The underlying log client.
    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Take a publish connection, waiting while the pool is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if a new connection has to be opened and that fails.
    pub async fn take_producer(&self) -> LogResult<PooledProducer<C>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LogError::Closed)?;

        let producer = match self.pop_idle() {
            Some(producer) => producer,
            None => {
                let producer = self.client.open_producer().await?;
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                debug!(
                    opened = self.counters.opened.load(Ordering::Relaxed),
                    "opened producer connection"
                );
                producer
            }
        };

        Ok(PooledProducer {
            producer: Some(producer),
            _permit: permit,
            idle: Arc::clone(&self.idle),
            capacity: self.max_producers,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Open a read connection for the duration of one call.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn read_connection(&self) -> LogResult<ReadConnection<C::Consumer>> {
        let consumer = self.client.open_consumer().await?;
        Ok(ReadConnection {
            consumer: Some(consumer),
        })
    }

    /// Open an admin session against `connection_string`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened.
    pub async fn admin_session(&self, connection_string: &str) -> LogResult<AdminSession<C::Admin>> {
        let admin = self.client.open_admin(connection_string).await?;
        Ok(AdminSession { admin: Some(admin) })
    }

    /// Close every idle publish connection.
    pub fn close_idle(&self) {
        let drained: Vec<_> = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for producer in drained {
            producer.close();
        }
    }

    /// Publish connections waiting to be taken.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Publish connections currently taken.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.max_producers - self.permits.available_permits()
    }

    /// Publish connections opened so far.
    #[must_use]
    pub fn opened_count(&self) -> usize {
        self.counters.opened.load(Ordering::Relaxed)
    }

    /// Publish connections terminated after a timeout.
    #[must_use]
    pub fn terminated_count(&self) -> usize {
        self.counters.terminated.load(Ordering::Relaxed)
    }

    /// Publish connections dropped on release because they were unusable.
    #[must_use]
    pub fn discarded_count(&self) -> usize {
        self.counters.discarded.load(Ordering::Relaxed)
    }

    fn pop_idle(&self) -> Option<C::Producer> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(producer) = idle.pop() {
            if producer.is_usable() {
                return Some(producer);
            }
            producer.close();
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
        None
    }
}

impl<C: LogClient> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.close_idle();
    }
}

/// A taken publish connection.
///
/// Dropping the guard releases the connection back to the pool.
pub struct PooledProducer<C: LogClient> {
    producer: Option<C::Producer>,
    _permit: OwnedSemaphorePermit,
    idle: Arc<Mutex<Vec<C::Producer>>>,
    capacity: usize,
    counters: Arc<PoolCounters>,
}

impl<C: LogClient> PooledProducer<C> {
    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection and evict it from the pool.
    pub fn terminate(mut self) {
        if let Some(producer) = self.producer.take() {
            producer.close();
            self.counters.terminated.fetch_add(1, Ordering::Relaxed);
            warn!("terminated producer connection");
        }
    }
}

impl<C: LogClient> Deref for PooledProducer<C> {
    type Target = C::Producer;

    fn deref(&self) -> &Self::Target {
        self.producer
            .as_ref()
            .expect("producer is present until the guard is consumed")
    }
}

impl<C: LogClient> Drop for PooledProducer<C> {
    fn drop(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };

        if !producer.is_usable() {
            warn!("discarding unusable producer connection on release");
            producer.close();
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.capacity {
            drop(idle);
            debug!("pool full, closing released producer connection");
            producer.close();
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            idle.push(producer);
        }
    }
}

/// A read connection that is closed when dropped.
pub struct ReadConnection<R: ConsumerConnection> {
    consumer: Option<R>,
}

impl<R: ConsumerConnection> Deref for ReadConnection<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        self.consumer
            .as_ref()
            .expect("consumer is present until the guard is dropped")
    }
}

impl<R: ConsumerConnection> DerefMut for ReadConnection<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.consumer
            .as_mut()
            .expect("consumer is present until the guard is dropped")
    }
}

impl<R: ConsumerConnection> Drop for ReadConnection<R> {
    fn drop(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            consumer.close();
        }
    }
}

/// An admin session that is closed when dropped.
pub struct AdminSession<A: TopicAdmin> {
    admin: Option<A>,
}

impl<A: TopicAdmin> Deref for AdminSession<A> {
    type Target = A;

    fn deref(&self) -> &Self::Target {
        self.admin
            .as_ref()
            .expect("admin is present until the guard is dropped")
    }
}

impl<A: TopicAdmin> DerefMut for AdminSession<A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.admin
            .as_mut()
            .expect("admin is present until the guard is dropped")
    }
}

impl<A: TopicAdmin> Drop for AdminSession<A> {
    fn drop(&mut self) {
        if let Some(mut admin) = self.admin.take() {
            admin.close();
        }
    }
}
