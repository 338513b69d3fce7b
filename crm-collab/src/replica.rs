//! One room's replica: a [`Document`] wired to durability, transport and
//! projection on a single control flow.
//!
//! ```text
//!  mutate ──► Document ──► snapshot + pending ──► Durability
//!                │  └────► delta ──────────────► SyncClient ──► relay
//!                ▼
//!            Projector ──► ProjectionHandle
//!
//!  relay ──► SyncClient ──► SyncEvent ──► process_events ──► Document.apply
//! ```
//!
//! The transport runs in its own task but never touches the document;
//! every merge happens inside [`Replica::process_events`], so the
//! document needs no locking.

use std::time::Duration;

use crm_core::{CodecError, Document, ProjectionHandle, Projector, Transaction, Update, VersionState};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use crate::protocol::{ProtocolError, SyncMessage, SyncReply};
use crate::storage::{Durability, SnapshotStore};

pub struct Replica {
    config: ClientConfig,
    doc: Document,
    projection: ProjectionHandle,
    durability: Durability,
    client: SyncClient,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    sessions: u64,
}

impl Replica {
    /// Build the replica and restore whatever `store` holds for the room.
    ///
    /// A snapshot that fails to decode is discarded; the relay handshake
    /// brings the state back. Persisted pending deltas go back into the
    /// offline queue.
    pub fn open(config: ClientConfig, store: Box<dyn SnapshotStore>) -> Self {
        let durability = if config.durability {
            Durability::new(config.room.clone(), store)
        } else {
            Durability::disabled(config.room.clone())
        };
        Self::with_durability(config, durability)
    }

    /// Replica without local persistence.
    pub fn ephemeral(config: ClientConfig) -> Self {
        let durability = Durability::disabled(config.room.clone());
        Self::with_durability(config, durability)
    }

    fn with_durability(config: ClientConfig, mut durability: Durability) -> Self {
        let mut doc = Document::new();
        let projection = Projector::attach(&mut doc);

        if let Some(snapshot) = durability.load() {
            match doc.import_snapshot(&snapshot) {
                Ok(_) => log::info!(
                    "Restored room '{}' from {} byte snapshot",
                    config.room,
                    snapshot.len()
                ),
                Err(e) => log::warn!("Discarding corrupt snapshot for room '{}': {e}", config.room),
            }
        }

        let (client, events) = SyncClient::with_events(config.clone(), doc.replica_id().as_uuid());
        let pending = durability.load_pending();
        if !pending.is_empty() {
            log::info!("Re-queued {} pending deltas for room '{}'", pending.len(), config.room);
        }
        for delta in pending {
            client.send_delta(delta);
        }

        Self {
            config,
            doc,
            projection,
            durability,
            client,
            events,
            sessions: 0,
        }
    }

    /// Commit a transaction locally, persist it, then hand it to the transport.
    pub fn mutate<F, R>(&mut self, f: F) -> Result<R, CodecError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, CodecError>,
    {
        let committed = self.doc.mutate(f)?;
        if let Some(update) = committed.update {
            self.persist();
            // Online deltas need no pending entry: the handshake covers a
            // connection lost mid-send.
            if self.client.connection_state() != ConnectionState::Connected {
                self.durability.append_pending(&update);
            }
            self.client.send_delta(update);
        }
        Ok(committed.output)
    }

    /// Start connecting in the background.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        self.client.connect()
    }

    /// Wait up to `wait` for a transport event, then handle it and every
    /// other event already waiting. Returns how many were handled.
    pub async fn process_events(&mut self, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        let mut handled = 0;
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(mpsc::error::TryRecvError::Empty) if handled == 0 => {
                    match timeout_at(deadline, self.events.recv()).await {
                        Ok(Some(event)) => event,
                        _ => break,
                    }
                }
                Err(_) => break,
            };
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Process events until `done` holds or `limit` elapses.
    pub async fn run_until<F>(&mut self, limit: Duration, done: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = Instant::now() + limit;
        while !done(self) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.process_events((deadline - now).min(Duration::from_millis(50))).await;
        }
        true
    }

    fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {
                // The offline queue is on the socket now
                self.sessions += 1;
                self.durability.clear_pending();
                self.announce();
            }
            SyncEvent::Disconnected => {
                log::debug!("Room '{}' offline, edits will be queued", self.config.room);
            }
            SyncEvent::SyncRequest { peer_id, state } => {
                if let Err(e) = self.answer(peer_id, &state) {
                    log::warn!("Ignoring sync request from {peer_id}: {e}");
                }
            }
            SyncEvent::SyncReply { peer_id, missing, state } => {
                self.merge_remote(peer_id, &missing);
                if let Err(e) = self.send_back(&state) {
                    log::warn!("Could not answer sync reply from {peer_id}: {e}");
                }
            }
            SyncEvent::RemoteDelta { peer_id, update } => {
                self.merge_remote(peer_id, &update);
            }
        }
    }

    /// Handshake step 1: tell the room what we have.
    fn announce(&self) {
        let sent = self
            .doc
            .state_vector()
            .map_err(|e| e.to_string())
            .and_then(|sv| {
                self.client
                    .send(&SyncMessage::sync_step1(self.peer_id(), sv))
                    .map_err(|e| e.to_string())
            });
        match sent {
            Ok(true) => log::debug!("Announced version state to room '{}'", self.config.room),
            Ok(false) => {}
            Err(e) => log::warn!("Could not announce version state: {e}"),
        }
    }

    /// Handshake step 2: give `peer` what it lacks plus our version state.
    fn answer(&self, peer: Uuid, remote_state: &[u8]) -> Result<(), String> {
        let missing = self.doc.diff_encoded(remote_state).map_err(|e| e.to_string())?;
        let reply = SyncReply {
            missing,
            state: self.doc.state_vector().map_err(|e| e.to_string())?,
        };
        let msg = SyncMessage::sync_step2(self.peer_id(), peer, &reply).map_err(|e| e.to_string())?;
        self.client.send(&msg).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Handshake step 3: send the responder what it lacks, if anything.
    fn send_back(&self, remote_state: &[u8]) -> Result<(), String> {
        let remote = VersionState::decode(remote_state).map_err(|e| e.to_string())?;
        let back = self.doc.diff(&remote).map_err(|e| e.to_string())?;
        let has_ops = !Update::decode(&back).map_err(|e| e.to_string())?.ops.is_empty();
        if has_ops {
            self.client
                .send(&SyncMessage::delta(self.peer_id(), back))
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn merge_remote(&mut self, peer: Uuid, update: &[u8]) {
        let known = self.doc.version_state().transaction_count();
        match self.doc.apply(update) {
            Ok(changed) => {
                if changed || self.doc.version_state().transaction_count() != known {
                    self.persist();
                }
            }
            Err(e) => log::warn!("Dropping malformed delta from {peer}: {e}"),
        }
    }

    fn persist(&mut self) {
        if !self.durability.is_enabled() {
            return;
        }
        match self.doc.export_snapshot() {
            Ok(snapshot) => {
                self.durability.save(&snapshot);
            }
            Err(e) => log::error!("Failed to export snapshot for room '{}': {e}", self.config.room),
        }
    }

    /// Stop the transport. Local state stays readable.
    pub async fn shutdown(&mut self) {
        self.client.shutdown().await;
        self.persist();
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn projection(&self) -> ProjectionHandle {
        self.projection.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.client.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }

    pub fn peer_id(&self) -> Uuid {
        self.client.peer_id()
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    /// Connections handled so far, handshake included.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    pub fn offline_queue_len(&self) -> usize {
        self.client.offline_queue_len()
    }

    pub fn durability(&self) -> &Durability {
        &self.durability
    }
}
