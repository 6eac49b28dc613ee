use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use lapin::acker::Acker;
use lapin::options::BasicAckOptions;
use lapin::BasicProperties;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::acknowledgements::{AcknowledgementChain, FailureContext};
use crate::core::message::DeliveryInfo;

/// Token forwarded by the signal tasks. OS signal handlers do nothing but
/// push one of these; all real work happens on the waiter loop.
#[derive(Debug)]
pub enum Signal {
    Shutdown(&'static str),
    Dump,
}

/// The acknowledgement decision for one delivery, produced on a consumer
/// task and executed on the waiter loop. Carries the acker of the channel
/// the delivery arrived on.
pub struct Action {
    pub consumer: String,
    pub delivery: DeliveryInfo,
    pub properties: BasicProperties,
    pub acker: Acker,
    pub kind: ActionKind,
}

pub enum ActionKind {
    Ack,
    Nack(Arc<anyhow::Error>),
}

/// Live per-consumer handler counts, dumped on USR2.
#[derive(Default)]
pub struct InflightRegistry {
    counts: Mutex<BTreeMap<String, usize>>,
}

impl InflightRegistry {
    pub fn enter(&self, consumer: &str) {
        let mut counts = self.counts.lock().expect("inflight registry poisoned");
        *counts.entry(consumer.to_string()).or_insert(0) += 1;
    }

    pub fn exit(&self, consumer: &str) {
        let mut counts = self.counts.lock().expect("inflight registry poisoned");
        if let Some(count) = counts.get_mut(consumer) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> Vec<(String, usize)> {
        self.counts
            .lock()
            .expect("inflight registry poisoned")
            .iter()
            .map(|(consumer, count)| (consumer.clone(), *count))
            .collect()
    }
}

/// Lets embedders and tests request a graceful shutdown without an OS
/// signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    signals: mpsc::UnboundedSender<Signal>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.signals.send(Signal::Shutdown("request"));
    }
}

/// The single serialisation point of the runtime.
///
/// One loop selects over the signal and action channels: shutdown tokens end
/// the loop, dump tokens log the in-flight snapshot, actions are executed in
/// enqueue order on the channel that received the delivery. Because every
/// ack and nack goes through here, acknowledgement traffic is ordered and
/// shutdown shares the same decision point.
pub struct Waiter {
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    action_tx: mpsc::UnboundedSender<Action>,
    action_rx: mpsc::UnboundedReceiver<Action>,
    inflight: Arc<InflightRegistry>,
}

impl Waiter {
    pub fn new(inflight: Arc<InflightRegistry>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        Self {
            signal_tx,
            signal_rx,
            action_tx,
            action_rx,
            inflight,
        }
    }

    pub fn action_sender(&self) -> mpsc::UnboundedSender<Action> {
        self.action_tx.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signals: self.signal_tx.clone(),
        }
    }

    /// Spawns the task that forwards OS signals as tokens.
    ///
    /// QUIT, TERM and INT request a graceful shutdown; USR2 requests a state
    /// dump. The handlers do nothing else, so they are safe at any moment.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut quit = signal(SignalKind::quit())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let signals = self.signal_tx.clone();

        Ok(tokio::spawn(async move {
            loop {
                let token = tokio::select! {
                    _ = quit.recv() => Signal::Shutdown("QUIT"),
                    _ = term.recv() => Signal::Shutdown("TERM"),
                    _ = int.recv() => Signal::Shutdown("INT"),
                    _ = usr2.recv() => Signal::Dump,
                };
                if signals.send(token).is_err() {
                    break;
                }
            }
        }))
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> std::io::Result<JoinHandle<()>> {
        let signals = self.signal_tx.clone();

        Ok(tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                if signals.send(Signal::Shutdown("INT")).is_err() {
                    break;
                }
            }
        }))
    }

    /// Blocks until a shutdown token arrives, executing actions and dump
    /// requests in the meantime. Returns the name of the shutdown signal.
    pub async fn wait(&mut self, chain: &AcknowledgementChain) -> &'static str {
        loop {
            tokio::select! {
                Some(token) = self.signal_rx.recv() => match token {
                    Signal::Shutdown(name) => {
                        info!(signal = name, "shutdown requested");
                        return name;
                    }
                    Signal::Dump => self.dump_state(),
                },
                Some(action) = self.action_rx.recv() => {
                    execute_action(action, chain).await;
                }
            }
        }
    }

    /// Executes every action already queued, without waiting for new ones.
    /// Called after the consumers have drained so late acks still reach the
    /// broker before disconnect.
    pub async fn flush_actions(&mut self, chain: &AcknowledgementChain) {
        while let Ok(action) = self.action_rx.try_recv() {
            execute_action(action, chain).await;
        }
    }

    fn dump_state(&self) {
        let snapshot = self.inflight.snapshot();
        if snapshot.is_empty() {
            info!("no consumers with in-flight handlers");
            return;
        }
        for (consumer, in_flight) in snapshot {
            info!(consumer = %consumer, in_flight, "consumer state");
        }
    }
}

async fn execute_action(action: Action, chain: &AcknowledgementChain) {
    match &action.kind {
        ActionKind::Ack => {
            if let Err(error) = action.acker.ack(BasicAckOptions::default()).await {
                error!(
                    ?error,
                    consumer = %action.consumer,
                    delivery_tag = action.delivery.delivery_tag,
                    "failed to ack delivery"
                );
            }
        }
        ActionKind::Nack(handler_error) => {
            chain
                .run(&FailureContext {
                    consumer: &action.consumer,
                    delivery: &action.delivery,
                    properties: &action.properties,
                    acker: &action.acker,
                    error: handler_error.as_ref(),
                })
                .await;
        }
    }
}
