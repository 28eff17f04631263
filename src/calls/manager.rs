//! Call manager for orchestrating call lifecycle.
//!
//! One [`CallManager`] task owns the [`SessionStore`] of a client. Local
//! commands, inbound channel messages, channel lifecycle events and ring
//! timer expiries all go through its single `select!` loop, so no two
//! transitions ever race. [`CallHandle`] is the cloneable front end.

use super::error::CallError;
use super::escrow::EscrowTransition;
use super::payload::{CallData, EscrowDetails};
use super::router::{EventRouter, Routed};
use super::state::{CallState, CallTransition, EndReason};
use super::store::{Notification, SessionStore, StoreSnapshot, StoreUpdate};
use crate::channel::{ChannelEvent, SignalingChannel};
use crate::config::SignalerConfig;
use crate::types::call::{Party, RoomId};
use crate::types::events::{ConnectionChanged, EventBus};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

#[derive(Debug)]
enum Command {
    Connect {
        auth_token: String,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Initiate {
        room_id: Option<RoomId>,
        receiver: Party,
        data: Option<Value>,
        reply: Reply<RoomId>,
    },
    Accept {
        room_id: RoomId,
        reply: Reply<()>,
    },
    Reject {
        room_id: RoomId,
        reply: Reply<()>,
    },
    End {
        room_id: RoomId,
        reply: Reply<()>,
    },
    RequestEscrow {
        details: EscrowDetails,
        reply: Reply<String>,
    },
    RespondEscrow {
        accept: bool,
        reply: Reply<()>,
    },
    AcknowledgeEscrow {
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<StoreSnapshot>,
    },
}

/// Owns one client's session state.
pub struct CallManager {
    config: SignalerConfig,
    store: SessionStore,
    router: EventRouter,
    events: Arc<EventBus>,
    connected: bool,
    commands: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
    inbound_rx: mpsc::Receiver<ChannelEvent>,
    timer_tx: mpsc::Sender<RingTimer>,
    timer_rx: mpsc::Receiver<RingTimer>,
    ring_generation: u64,
}

/// Expiry of the ring timer armed for one ringing phase.
#[derive(Debug)]
struct RingTimer {
    room_id: RoomId,
    generation: u64,
}

impl CallManager {
    /// Create a manager for `local` and the handle that drives it.
    pub fn new(
        local: Party,
        channel: Arc<dyn SignalingChannel>,
        config: SignalerConfig,
    ) -> (Self, CallHandle) {
        let (command_tx, commands) = mpsc::channel(config.command_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (timer_tx, timer_rx) = mpsc::channel(config.command_capacity);
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));

        let handle = CallHandle {
            commands: command_tx,
            events: events.clone(),
            local: local.clone(),
        };
        let manager = Self {
            config,
            store: SessionStore::new(local),
            router: EventRouter::new(channel),
            events,
            connected: false,
            commands,
            inbound_tx,
            inbound_rx,
            timer_tx,
            timer_rx,
            ring_generation: 0,
        };
        (manager, handle)
    }

    /// Create a manager and run it on the current tokio runtime.
    pub fn spawn(
        local: Party,
        channel: Arc<dyn SignalingChannel>,
        config: SignalerConfig,
    ) -> CallHandle {
        let (manager, handle) = Self::new(local, channel, config);
        tokio::spawn(manager.run());
        handle
    }

    /// Process commands and events until every handle is dropped.
    pub async fn run(mut self) {
        info!("CallManager for {} started", self.store.local().id);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.inbound_rx.recv() => self.handle_channel_event(event).await,
                Some(timer) = self.timer_rx.recv() => self.handle_ring_timeout(timer).await,
            }
        }

        if self.connected {
            self.router.channel().disconnect().await;
        }
        info!("CallManager for {} stopped", self.store.local().id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { auth_token, reply } => {
                let _ = reply.send(self.connect(&auth_token).await);
            }
            Command::Disconnect { reply } => {
                self.router.channel().disconnect().await;
                self.on_disconnected(EndReason::Disconnected);
                let _ = reply.send(Ok(()));
            }
            Command::Initiate {
                room_id,
                receiver,
                data,
                reply,
            } => {
                let _ = reply.send(self.initiate(room_id, receiver, data).await);
            }
            Command::Accept { room_id, reply } => {
                let result = self.local_call(CallTransition::Accept { room_id }).await;
                let _ = reply.send(result);
            }
            Command::Reject { room_id, reply } => {
                let result = self.local_call(CallTransition::Reject { room_id }).await;
                let _ = reply.send(result);
            }
            Command::End { room_id, reply } => {
                let result = self.local_call(CallTransition::End { room_id }).await;
                let _ = reply.send(result);
            }
            Command::RequestEscrow { details, reply } => {
                let result = self
                    .local_escrow(EscrowTransition::Request { details })
                    .await
                    .map(|_| {
                        self.store
                            .escrow()
                            .map(|n| n.reference.clone())
                            .unwrap_or_default()
                    });
                let _ = reply.send(result);
            }
            Command::RespondEscrow { accept, reply } => {
                let result = self.local_escrow(EscrowTransition::Respond { accept }).await;
                let _ = reply.send(result);
            }
            Command::AcknowledgeEscrow { reply } => {
                let result = self
                    .store
                    .apply_escrow(EscrowTransition::Acknowledge)
                    .map(|update| self.dispatch(&update));
                let _ = reply.send(result);
            }
            Command::Reset { reply } => {
                let update = self.store.reset(EndReason::Reset);
                self.dispatch(&update);
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
        }
    }

    async fn connect(&mut self, auth_token: &str) -> Result<(), CallError> {
        if self.connected {
            debug!("Connect requested but already connected");
            return Ok(());
        }
        let channel = self.router.channel().clone();
        channel.connect(auth_token, self.inbound_tx.clone()).await?;
        if let Err(e) = self.router.subscribe(&self.inbound_tx).await {
            error!("Failed to subscribe to signaling topics: {}", e);
            channel.disconnect().await;
            return Err(e.into());
        }
        self.set_connected(true);
        info!("{} connected to signaling", self.store.local().id);
        Ok(())
    }

    async fn initiate(
        &mut self,
        room_id: Option<RoomId>,
        receiver: Party,
        data: Option<Value>,
    ) -> Result<RoomId, CallError> {
        self.ensure_connected()?;
        if let Some(current) = self.store.room_id() {
            return Err(CallError::Busy(current.clone()));
        }
        let local = self.store.local().clone();
        if receiver.id == local.id {
            return Err(CallError::InvalidTransition(
                super::state::InvalidTransition {
                    current_state: format!("{:?}", CallState::Idle),
                    attempted: "Initiate (self call)".to_string(),
                },
            ));
        }

        let room_id = room_id.unwrap_or_else(|| RoomId::generate(&local));
        let mut call_data = CallData::new(room_id.clone(), local, receiver);
        call_data.data = data;

        info!("Placing call {} to {}", room_id, call_data.receiver);
        self.local_call(CallTransition::Initiate { data: call_data })
            .await?;
        Ok(room_id)
    }

    async fn local_call(&mut self, trigger: CallTransition) -> Result<(), CallError> {
        self.ensure_connected()?;
        let update = self.router.local_call(&mut self.store, trigger).await?;
        self.dispatch(&update);
        Ok(())
    }

    async fn local_escrow(&mut self, trigger: EscrowTransition) -> Result<(), CallError> {
        self.ensure_connected()?;
        let update = self.router.local_escrow(&mut self.store, trigger).await?;
        self.dispatch(&update);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), CallError> {
        if self.connected {
            Ok(())
        } else {
            Err(CallError::NotConnected)
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.set_connected(true),
            ChannelEvent::Disconnected => {
                if self.connected {
                    warn!("Signaling channel dropped for {}", self.store.local().id);
                }
                self.on_disconnected(EndReason::Disconnected);
            }
            ChannelEvent::Message(raw) => {
                if !self.connected {
                    debug!("Ignoring {} received while disconnected", raw.topic);
                    return;
                }
                match self.router.handle_inbound(&mut self.store, &raw).await {
                    Routed::Applied(update) => self.dispatch(&update),
                    Routed::Dropped(dropped) => {
                        let _ = self.events.dropped.send(Arc::new(dropped));
                    }
                }
            }
        }
    }

    async fn handle_ring_timeout(&mut self, timer: RingTimer) {
        let RingTimer {
            room_id,
            generation,
        } = timer;
        // Room ids can be reused, so only the most recently armed timer counts.
        if generation != self.ring_generation {
            debug!("Ring timer for an earlier attempt in {} expired", room_id);
            return;
        }
        match self.store.apply_call(CallTransition::RingTimeout {
            room_id: room_id.clone(),
        }) {
            Ok(update) if update.is_ignored() => {
                debug!("Ring timer for {} expired after the call moved on", room_id);
            }
            Ok(update) => {
                info!("Call {} was not answered in time", room_id);
                self.router.publish(&update.outbound).await;
                self.dispatch(&update);
            }
            Err(e) => warn!("Ring timeout for {} failed: {}", room_id, e),
        }
    }

    /// Transport loss: no way to know what the peer saw, so drop everything.
    fn on_disconnected(&mut self, reason: EndReason) {
        let update = self.store.reset(reason);
        if !update.notifications.is_empty() {
            info!("Session state reset after disconnect");
        }
        self.dispatch(&update);
        self.set_connected(false);
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            let _ = self
                .events
                .connection
                .send(Arc::new(ConnectionChanged { connected }));
        }
    }

    /// Publish notifications on the event bus and arm ring timers.
    fn dispatch(&mut self, update: &StoreUpdate) {
        for notification in &update.notifications {
            // Sending fails only when nobody listens.
            match notification {
                Notification::CallState(change) => {
                    if change.current.is_ringing() {
                        self.arm_ring_timer(change.room_id.clone());
                    }
                    let _ = self.events.call_state.send(Arc::new(change.clone()));
                }
                Notification::SessionEnded(ended) => {
                    info!(
                        "Call {} ended ({:?})",
                        ended.session.room_id, ended.reason
                    );
                    let _ = self.events.session_ended.send(Arc::new(ended.clone()));
                }
                Notification::EscrowState(change) => {
                    let _ = self.events.escrow_state.send(Arc::new(change.clone()));
                }
                Notification::Cue(cue) => {
                    let _ = self.events.ui.send(Arc::new(cue.clone()));
                }
            }
        }
    }

    fn arm_ring_timer(&mut self, room_id: RoomId) {
        let Some(timeout) = self.config.ring_timeout else {
            return;
        };
        self.ring_generation += 1;
        let generation = self.ring_generation;
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx
                .send(RingTimer {
                    room_id,
                    generation,
                })
                .await;
        });
    }
}

/// Cloneable handle to a running [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: Arc<EventBus>,
    local: Party,
}

impl CallHandle {
    pub fn local(&self) -> &Party {
        &self.local
    }

    /// Notifications for the presentation layer.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CallError::CoordinatorClosed)?;
        rx.await.map_err(|_| CallError::CoordinatorClosed)?
    }

    pub async fn connect(&self, auth_token: impl Into<String>) -> Result<(), CallError> {
        let auth_token = auth_token.into();
        self.request(|reply| Command::Connect { auth_token, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Place a call in a freshly generated room.
    pub async fn initiate(&self, receiver: Party, data: Option<Value>) -> Result<RoomId, CallError> {
        self.request(|reply| Command::Initiate {
            room_id: None,
            receiver,
            data,
            reply,
        })
        .await
    }

    /// Place a call in a caller-chosen room. The id must be new for this attempt.
    pub async fn initiate_in(
        &self,
        room_id: impl Into<RoomId>,
        receiver: Party,
        data: Option<Value>,
    ) -> Result<RoomId, CallError> {
        let room_id = room_id.into();
        self.request(|reply| Command::Initiate {
            room_id: Some(room_id),
            receiver,
            data,
            reply,
        })
        .await
    }

    pub async fn accept(&self, room_id: impl Into<RoomId>) -> Result<(), CallError> {
        let room_id = room_id.into();
        self.request(|reply| Command::Accept { room_id, reply }).await
    }

    pub async fn reject(&self, room_id: impl Into<RoomId>) -> Result<(), CallError> {
        let room_id = room_id.into();
        self.request(|reply| Command::Reject { room_id, reply }).await
    }

    /// Hang up, or cancel a call that is still ringing.
    pub async fn end(&self, room_id: impl Into<RoomId>) -> Result<(), CallError> {
        let room_id = room_id.into();
        self.request(|reply| Command::End { room_id, reply }).await
    }

    /// Ask the peer to pay. Returns the negotiation reference.
    pub async fn request_escrow(
        &self,
        amount: f64,
        item_title: impl Into<String>,
        item_description: impl Into<String>,
    ) -> Result<String, CallError> {
        let details = EscrowDetails {
            amount,
            item_title: item_title.into(),
            item_description: item_description.into(),
            reference: None,
            call_session_id: None,
        };
        self.request(|reply| Command::RequestEscrow { details, reply })
            .await
    }

    pub async fn respond_escrow(&self, accept: bool) -> Result<(), CallError> {
        self.request(|reply| Command::RespondEscrow { accept, reply })
            .await
    }

    /// Clear a settled negotiation once the UI has shown it.
    pub async fn acknowledge_escrow(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcknowledgeEscrow { reply })
            .await
    }

    /// Drop all session state without telling the peer.
    pub async fn reset(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| CallError::CoordinatorClosed)?;
        rx.await.map_err(|_| CallError::CoordinatorClosed)
    }
}
