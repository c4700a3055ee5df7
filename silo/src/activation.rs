// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Activation execution
//!
//! Each activation runs in its own task, owned by an `ActivationRunner`. The
//! runner takes commands from an unbounded FIFO queue and executes one turn
//! at a time, so the grain never sees two requests at once.
//!
//! A reentrant grain keeps its turns in flight together. A request whose
//! call chain already holds the activation starts at once; any other request
//! waits until no turn is running.
//!
//! Lifecycle: Created → Valid → Deactivating → Terminated, or Created →
//! Failed → Terminated when loading the state or the activation hook fails.
//!
//! Turns still queued when the activation is deactivated are answered with
//! `StaleActivation`, which makes the caller's router re-resolve the grain.
//!

use crate::{
    error::Error,
    grain::{GrainContext, GrainInstance, GrainTypeOptions, ReentrantGrain},
    identity::ActivationAddress,
    message::{RequestEnvelope, ResponseEnvelope},
};

use store::GrainStorage;

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Activity counters shared by an activation and the collector.
#[derive(Debug)]
pub struct ActivationStats {
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    keep_alive_until: Mutex<Option<Instant>>,
    deactivation_requested: AtomicBool,
}

impl Default for ActivationStats {
    fn default() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            keep_alive_until: Mutex::new(None),
            deactivation_requested: AtomicBool::new(false),
        }
    }
}

impl ActivationStats {
    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn enqueued(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    pub(crate) fn request_deactivation(&self) {
        self.deactivation_requested.store(true, Ordering::SeqCst);
    }

    pub fn deactivation_requested(&self) -> bool {
        self.deactivation_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn keep_alive_for(&self, period: Duration) {
        let until = Instant::now() + period;
        let mut keep_alive = self
            .keep_alive_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if keep_alive.is_none_or(|current| current < until) {
            *keep_alive = Some(until);
        }
    }

    /// True when the collector may deactivate the activation.
    pub fn is_collectable(&self, now: Instant, age: Duration) -> bool {
        if self.in_flight() > 0 {
            return false;
        }
        if self.deactivation_requested() {
            return true;
        }
        let kept_alive = self
            .keep_alive_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|until| until > now);
        !kept_alive && self.idle_for(now) >= age
    }
}

type TurnReply = oneshot::Sender<Result<ResponseEnvelope, Error>>;

/// Commands queued to an activation.
pub(crate) enum ActivationCommand {
    Turn {
        envelope: RequestEnvelope,
        reply: TurnReply,
    },
    Stop {
        /// Save the grain state after the deactivation hook.
        persist: bool,
        done: oneshot::Sender<()>,
    },
}

/// Handle of a running activation, held by the catalog.
#[derive(Clone)]
pub struct ActivationHandle {
    address: ActivationAddress,
    sender: mpsc::UnboundedSender<ActivationCommand>,
    stats: Arc<ActivationStats>,
    options: GrainTypeOptions,
    reentrant: bool,
}

impl ActivationHandle {
    pub fn address(&self) -> &ActivationAddress {
        &self.address
    }

    pub fn stats(&self) -> &Arc<ActivationStats> {
        &self.stats
    }

    pub fn options(&self) -> &GrainTypeOptions {
        &self.options
    }

    /// True when turns of the same call chain may interleave.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Queues a turn and waits for its result.
    pub async fn request(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        let (reply, receiver) = oneshot::channel();
        self.stats.enqueued();
        if self
            .sender
            .send(ActivationCommand::Turn { envelope, reply })
            .is_err()
        {
            self.stats.finished();
            return Err(Error::StaleActivation(self.address.clone()));
        }
        receiver
            .await
            .unwrap_or_else(|_| Err(Error::StaleActivation(self.address.clone())))
    }

    /// Stops the activation and waits until it has terminated.
    pub async fn stop(&self, persist: bool) {
        let (done, wait) = oneshot::channel();
        if self
            .sender
            .send(ActivationCommand::Stop { persist, done })
            .is_ok()
        {
            let _ = wait.await;
        }
    }
}

/// Lifecycle of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivationLifecycle {
    Created,
    Valid,
    Deactivating { persist: bool },
    Failed,
    Terminated,
}

pub(crate) struct ActivationRunner {
    address: ActivationAddress,
    grain: GrainInstance,
    lifecycle: ActivationLifecycle,
    receiver: mpsc::UnboundedReceiver<ActivationCommand>,
    stats: Arc<ActivationStats>,
    storage: Option<Arc<dyn GrainStorage>>,
    /// Where to report that the grain asked to be deactivated.
    idle_sender: mpsc::UnboundedSender<ActivationAddress>,
    idle_reported: bool,
    stop_ack: Option<oneshot::Sender<()>>,
}

impl ActivationRunner {
    pub(crate) fn create(
        address: ActivationAddress,
        grain: GrainInstance,
        options: GrainTypeOptions,
        storage: Option<Arc<dyn GrainStorage>>,
        idle_sender: mpsc::UnboundedSender<ActivationAddress>,
    ) -> (Self, ActivationHandle) {
        debug!("Creating activation {}.", address);
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(ActivationStats::default());
        let handle = ActivationHandle {
            address: address.clone(),
            sender,
            stats: stats.clone(),
            options,
            reentrant: grain.is_reentrant(),
        };
        let runner = ActivationRunner {
            address,
            grain,
            lifecycle: ActivationLifecycle::Created,
            receiver,
            stats,
            storage,
            idle_sender,
            idle_reported: false,
            stop_ack: None,
        };
        (runner, handle)
    }

    /// Drives the activation from creation to termination.
    ///
    /// `started` receives the outcome of loading the state and running the
    /// activation hook.
    pub(crate) async fn init(
        mut self,
        mut ctx: GrainContext,
        started: oneshot::Sender<Result<(), Error>>,
    ) {
        let mut started = Some(started);
        loop {
            match self.lifecycle {
                ActivationLifecycle::Created => {
                    match self.activate(&mut ctx).await {
                        Ok(()) => {
                            debug!("Activation {} is valid.", self.address);
                            self.lifecycle = ActivationLifecycle::Valid;
                            if let Some(started) = started.take() {
                                let _ = started.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            warn!("Activation {} failed: {}", self.address, e);
                            self.lifecycle = ActivationLifecycle::Failed;
                            if let Some(started) = started.take() {
                                let _ = started.send(Err(e));
                            }
                        }
                    }
                }
                ActivationLifecycle::Valid => {
                    self.run(&mut ctx).await;
                }
                ActivationLifecycle::Deactivating { persist } => {
                    self.deactivate(&mut ctx, persist).await;
                    self.lifecycle = ActivationLifecycle::Terminated;
                }
                ActivationLifecycle::Failed => {
                    self.drain();
                    self.lifecycle = ActivationLifecycle::Terminated;
                }
                ActivationLifecycle::Terminated => {
                    debug!("Activation {} terminated.", self.address);
                    if let Some(ack) = self.stop_ack.take() {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }
    }

    async fn activate(&mut self, ctx: &mut GrainContext) -> Result<(), Error> {
        if let Some(storage) = &self.storage {
            let grain = &self.address.grain;
            if let Some(state) =
                storage.read_state(grain.grain_type(), grain.key())?
            {
                self.grain.load_state(&state)?;
            }
        }
        self.grain.on_activate(ctx).await
    }

    async fn run(&mut self, ctx: &mut GrainContext) {
        if let GrainInstance::Reentrant(grain) = &self.grain {
            let grain = grain.clone();
            self.run_reentrant(grain, ctx).await;
            return;
        }
        loop {
            match self.receiver.recv().await {
                Some(ActivationCommand::Turn { envelope, reply }) => {
                    ctx.set_call_chain(envelope.call_chain.clone());
                    let result = self.grain.handle(envelope, ctx).await;
                    self.turn_finished(reply, result);
                }
                Some(ActivationCommand::Stop { persist, done }) => {
                    self.stop_ack = Some(done);
                    self.lifecycle = ActivationLifecycle::Deactivating { persist };
                    return;
                }
                None => {
                    self.lifecycle =
                        ActivationLifecycle::Deactivating { persist: true };
                    return;
                }
            }
        }
    }

    async fn run_reentrant(&mut self, grain: Arc<dyn ReentrantGrain>, ctx: &GrainContext) {
        let mut running = FuturesUnordered::new();
        let mut waiting: VecDeque<(RequestEnvelope, TurnReply)> = VecDeque::new();
        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(ActivationCommand::Turn { envelope, reply }) => {
                        if running.is_empty()
                            || envelope.call_chain.contains(&self.address.activation)
                        {
                            if !running.is_empty() {
                                trace!("Interleaving a turn of {}.", self.address);
                            }
                            running.push(reentrant_turn(grain.clone(), ctx.clone(), envelope, reply));
                        } else {
                            waiting.push_back((envelope, reply));
                        }
                    }
                    Some(ActivationCommand::Stop { persist, done }) => {
                        self.stop_ack = Some(done);
                        self.lifecycle = ActivationLifecycle::Deactivating { persist };
                        break;
                    }
                    None => {
                        self.lifecycle = ActivationLifecycle::Deactivating { persist: true };
                        break;
                    }
                },
                Some((reply, result)) = running.next(), if !running.is_empty() => {
                    self.turn_finished(reply, result);
                    if running.is_empty() {
                        if let Some((envelope, reply)) = waiting.pop_front() {
                            running.push(reentrant_turn(grain.clone(), ctx.clone(), envelope, reply));
                        }
                    }
                }
            }
        }

        // Turns that never started are stale; started ones run to the end.
        for (_, reply) in waiting {
            self.stats.finished();
            let _ = reply.send(Err(Error::StaleActivation(self.address.clone())));
        }
        self.drain();
        while let Some((reply, result)) = running.next().await {
            self.turn_finished(reply, result);
        }
    }

    fn turn_finished(&mut self, reply: TurnReply, result: Result<ResponseEnvelope, Error>) {
        self.stats.finished();
        let _ = reply.send(result);
        if self.stats.deactivation_requested() && !self.idle_reported {
            self.idle_reported = true;
            let _ = self.idle_sender.send(self.address.clone());
        }
    }

    async fn deactivate(&mut self, ctx: &mut GrainContext, persist: bool) {
        debug!("Deactivating {}.", self.address);
        self.drain();
        if let Err(e) = self.grain.on_deactivate(ctx).await {
            error!("Deactivation hook of {} failed: {}", self.address, e);
        }
        if !persist {
            return;
        }
        let Some(storage) = &self.storage else {
            return;
        };
        let grain = &self.address.grain;
        match self.grain.save_state() {
            Ok(Some(state)) => {
                if let Err(e) =
                    storage.write_state(grain.grain_type(), grain.key(), &state)
                {
                    error!("Can not store state of {}: {}", self.address, e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Can not save state of {}: {}", self.address, e),
        }
    }

    /// Answers every queued turn with `StaleActivation`.
    fn drain(&mut self) {
        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                ActivationCommand::Turn { reply, .. } => {
                    self.stats.finished();
                    let _ = reply
                        .send(Err(Error::StaleActivation(self.address.clone())));
                }
                ActivationCommand::Stop { done, .. } => {
                    let _ = done.send(());
                }
            }
        }
    }
}

fn reentrant_turn(
    grain: Arc<dyn ReentrantGrain>,
    mut ctx: GrainContext,
    envelope: RequestEnvelope,
    reply: TurnReply,
) -> BoxFuture<'static, (TurnReply, Result<ResponseEnvelope, Error>)> {
    Box::pin(async move {
        ctx.set_call_chain(envelope.call_chain.clone());
        let result = grain.handle(envelope, &mut ctx).await;
        (reply, result)
    })
}
