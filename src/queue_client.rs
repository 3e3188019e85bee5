//! Lifecycle-guarded client for a single named queue.
//!
//! A [`QueueClient`] owns one [`Broker`] connection. After [`QueueClient::connect`]
//! it can publish, purge, and run at most one consumption session at a time,
//! either on the caller's task ([`QueueClient::start_consuming_blocking`]) or
//! on a background worker ([`QueueClient::start_consuming_async`]).
//!
//! Both modes run the same loop: poll one message, hand it to the
//! [`MessageHandler`], acknowledge it, idle, repeat. A message is acknowledged
//! only after its handler returned successfully. A failing handler ends the
//! session and leaves its message unacknowledged for the broker to redeliver.

use crate::broker::{Broker, CONTENT_TYPE};
use crate::configuration::SimulationConfig;
use crate::error::QueueError;
use crate::message::MalformedMessage;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(250);
/// Lower bound for the pause after an empty poll, so a zero idle interval
/// does not spin against the broker.
pub const MIN_EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionState {
    Idle,
    Consuming,
    Stopping,
}

/// Consumption strategy plugged into a session.
///
/// Return `ControlFlow::Break(())` to acknowledge the message and end the
/// session from inside the loop. Do not call [`QueueClient::stop_consuming`]
/// from a handler; it waits for the very loop the handler runs on.
pub trait MessageHandler: Send {
    fn handle(&mut self, body: &[u8]) -> anyhow::Result<ControlFlow<()>>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&[u8]) -> anyhow::Result<ControlFlow<()>> + Send,
{
    fn handle(&mut self, body: &[u8]) -> anyhow::Result<ControlFlow<()>> {
        self(body)
    }
}

type Worker = JoinHandle<Result<(), QueueError>>;

struct Session {
    token: CancellationToken,
    worker: Option<Worker>,
}

/// Puts the client back to `Idle` when a consume loop ends, however it ends.
struct IdleOnExit {
    state: Arc<watch::Sender<ConsumptionState>>,
}

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        self.state.send_replace(ConsumptionState::Idle);
    }
}

pub struct QueueClient<B: Broker> {
    broker: Arc<B>,
    queue_name: String,
    idle_interval: Duration,
    connected: AtomicBool,
    state: Arc<watch::Sender<ConsumptionState>>,
    // Lifecycle transitions (start, stop) happen under this lock.
    session: Mutex<Option<Session>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: Broker> QueueClient<B> {
    pub fn new(config: &SimulationConfig, broker: B) -> Self {
        Self::for_queue(&config.queue_name, broker)
    }

    pub fn for_queue(queue_name: &str, broker: B) -> Self {
        let (state, _) = watch::channel(ConsumptionState::Idle);
        Self {
            broker: Arc::new(broker),
            queue_name: queue_name.to_string(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            connected: AtomicBool::new(false),
            state: Arc::new(state),
            session: Mutex::new(None),
        }
    }

    /// Pause after each handled message and between empty polls.
    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn consumption_state(&self) -> ConsumptionState {
        *self.state.borrow()
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(QueueError::NotConnected),
        }
    }

    /// Opens the broker connection and declares the queue. The client only
    /// counts as connected once both steps succeeded.
    pub async fn connect(&self) -> Result<(), QueueError> {
        if let Err(e) = self.broker.connect().await {
            self.connected.store(false, Ordering::Release);
            warn!("Could not connect to the broker: {e}");
            return Err(QueueError::Connection(e));
        }

        if let Err(source) = self.broker.declare_queue(&self.queue_name).await {
            self.connected.store(false, Ordering::Release);
            warn!("Could not set up queue '{}': {source}", self.queue_name);
            if let Err(e) = self.broker.close().await {
                debug!("Closing half-open connection failed: {e}");
            }
            return Err(QueueError::QueueConnection {
                queue: self.queue_name.clone(),
                source,
            });
        }

        self.connected.store(true, Ordering::Release);
        if self.broker.settles_on_fetch() {
            warn!(
                "Broker settles messages on fetch, failed messages on '{}' will not be redelivered",
                self.queue_name
            );
        }
        info!("Connected to queue '{}'", self.queue_name);
        Ok(())
    }

    /// Publishes `body` as `text/plain` onto the bound queue. No retries.
    pub async fn publish(&self, body: impl AsRef<[u8]>) -> Result<(), QueueError> {
        self.ensure_connected()?;
        self.broker
            .publish(&self.queue_name, body.as_ref(), CONTENT_TYPE)
            .await
            .map_err(QueueError::Publish)
    }

    /// Drops every ready message in the queue and returns how many there were.
    pub async fn purge(&self) -> Result<u32, QueueError> {
        self.ensure_connected()?;
        let purged = self.broker.purge(&self.queue_name).await?;
        info!("Purged {purged} messages from '{}'", self.queue_name);
        Ok(purged)
    }

    /// Idle -> Consuming, or `AlreadyConsuming`. Callers hold the session lock.
    fn claim(&self) -> Result<IdleOnExit, QueueError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ConsumptionState::Idle {
                *state = ConsumptionState::Consuming;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(QueueError::AlreadyConsuming);
        }
        Ok(IdleOnExit {
            state: self.state.clone(),
        })
    }

    /// Runs the consume loop on the current task until the handler breaks,
    /// [`stop_consuming`](Self::stop_consuming) is called from another task,
    /// or a failure ends it.
    pub async fn start_consuming_blocking<H: MessageHandler>(
        &self,
        handler: H,
    ) -> Result<(), QueueError> {
        self.start_consuming_blocking_until(handler, &CancellationToken::new())
            .await
    }

    /// Same as [`start_consuming_blocking`](Self::start_consuming_blocking),
    /// but the session also ends when `cancel` fires. An already cancelled
    /// token returns right away without polling.
    pub async fn start_consuming_blocking_until<H: MessageHandler>(
        &self,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let (token, on_exit) = {
            let mut session = lock(&self.session);
            let on_exit = self.claim()?;
            let token = cancel.child_token();
            *session = Some(Session {
                token: token.clone(),
                worker: None,
            });
            (token, on_exit)
        };

        info!("Consuming from '{}' on the current task", self.queue_name);
        consume(
            self.broker.clone(),
            self.queue_name.clone(),
            self.idle_interval,
            token,
            handler,
            on_exit,
        )
        .await
    }

    /// Spawns a fresh background worker running the consume loop and returns
    /// immediately. Must be called from within a tokio runtime.
    pub fn start_consuming_async<H: MessageHandler + 'static>(
        &self,
        handler: H,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let mut session = lock(&self.session);
        let on_exit = self.claim()?;
        let token = CancellationToken::new();

        let broker = self.broker.clone();
        let queue_name = self.queue_name.clone();
        let idle_interval = self.idle_interval;
        let worker_token = token.clone();
        let worker = tokio::spawn(async move {
            let result = consume(
                broker,
                queue_name.clone(),
                idle_interval,
                worker_token,
                handler,
                on_exit,
            )
            .await;
            if let Err(e) = &result {
                error!("Consumer worker for '{queue_name}' failed: {e}");
            }
            result
        });

        *session = Some(Session {
            token,
            worker: Some(worker),
        });
        info!("Started background consumer for '{}'", self.queue_name);
        Ok(())
    }

    /// Signals the running session to stop and waits until its loop exited.
    ///
    /// For a background session this joins the worker and returns its outcome.
    pub async fn stop_consuming(&self) -> Result<(), QueueError> {
        let session = {
            let mut session = lock(&self.session);
            let stopping = self.state.send_if_modified(|state| {
                if *state == ConsumptionState::Consuming {
                    *state = ConsumptionState::Stopping;
                    true
                } else {
                    false
                }
            });
            if !stopping {
                return Err(QueueError::NotConsuming);
            }
            session.take()
        };

        let worker = session.and_then(|session| {
            session.token.cancel();
            session.worker
        });
        let result = match worker {
            Some(worker) => join(worker).await,
            None => {
                self.wait_until_idle().await;
                Ok(())
            }
        };
        info!("Stopped consuming from '{}'", self.queue_name);
        result
    }

    /// Waits for the background worker to finish on its own (for example after
    /// its handler broke the loop) and returns its outcome.
    pub async fn wait_for_worker(&self) -> Result<(), QueueError> {
        let worker = lock(&self.session)
            .as_mut()
            .and_then(|session| session.worker.take());
        match worker {
            Some(worker) => join(worker).await,
            None => Err(QueueError::NotConsuming),
        }
    }

    async fn wait_until_idle(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = state
            .wait_for(|state| *state == ConsumptionState::Idle)
            .await;
    }

    /// Stops any running session and closes the broker connection.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.consumption_state() == ConsumptionState::Consuming {
            match self.stop_consuming().await {
                Ok(()) | Err(QueueError::NotConsuming) => {}
                Err(e) => warn!("Consumer ended with an error while closing: {e}"),
            }
        }
        self.connected.store(false, Ordering::Release);
        self.broker.close().await?;
        info!("Closed connection for '{}'", self.queue_name);
        Ok(())
    }
}

impl<B: Broker> Drop for QueueClient<B> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.token.cancel();
        }
    }
}

async fn join(worker: Worker) -> Result<(), QueueError> {
    worker.await.unwrap_or_else(|e| {
        Err(QueueError::Handler(anyhow::anyhow!(
            "consumer worker panicked: {e}"
        )))
    })
}

fn handler_error(e: anyhow::Error) -> QueueError {
    match e.downcast::<MalformedMessage>() {
        Ok(malformed) => QueueError::MalformedMessage(malformed),
        Err(e) => QueueError::Handler(e),
    }
}

async fn consume<B: Broker, H: MessageHandler>(
    broker: Arc<B>,
    queue_name: String,
    idle_interval: Duration,
    token: CancellationToken,
    mut handler: H,
    _on_exit: IdleOnExit,
) -> Result<(), QueueError> {
    let mut handled = 0u64;

    while !token.is_cancelled() {
        let delivery = broker
            .poll(&queue_name)
            .await
            .map_err(QueueError::Consume)?;

        let pause = match delivery {
            Some(delivery) => {
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    "Received message from '{queue_name}'"
                );
                let flow = handler.handle(&delivery.body).map_err(handler_error)?;
                broker
                    .ack(delivery.delivery_tag)
                    .await
                    .map_err(QueueError::Consume)?;
                handled += 1;
                if flow.is_break() {
                    info!("Handler ended consumption of '{queue_name}'");
                    break;
                }
                idle_interval
            }
            None => idle_interval.max(MIN_EMPTY_POLL_INTERVAL),
        };

        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    info!("Consume loop for '{queue_name}' exited after {handled} messages");
    Ok(())
}
