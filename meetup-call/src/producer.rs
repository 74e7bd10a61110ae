//! Local producers (microphone, webcam)
//!
//! At most one producer exists per media kind. A kind is claimed with
//! `reserve` before any device is opened; the claim is what makes a second
//! concurrent enable fail with `AlreadyProducing`. While the produce is in
//! flight the device track is parked in the claimed slot, so a teardown in
//! the meantime still releases it.

use meetup_proto::methods::{ProducerIdRequest, CLOSE_PRODUCER, PAUSE_PRODUCER, RESUME_PRODUCER};
use meetup_proto::{MediaKind, RtpCodecCapability, RtpEncodingParameters};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{EngineProducer, LocalTrack, OwnedTrack, ProduceOptions};
use crate::signaling::SignalingChannel;
use crate::transport::TransportHandle;
use crate::types::ProducerId;

/// Encoder settings for one produce call
#[derive(Debug, Clone)]
pub struct ProduceParams {
    pub codec: RtpCodecCapability,
    pub encodings: Vec<RtpEncodingParameters>,
    pub codec_options: Map<String, Value>,
}

/// Read-only view of a producer
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track: Arc<dyn LocalTrack>,
    pub paused: bool,
}

struct ProducerEntry {
    id: ProducerId,
    kind: MediaKind,
    track: OwnedTrack,
    engine: Arc<dyn EngineProducer>,
    paused: AtomicBool,
    closed: AtomicBool,
    /// Serializes pause, resume and close
    op_lock: tokio::sync::Mutex<()>,
}

impl ProducerEntry {
    fn snapshot(&self) -> Producer {
        Producer {
            id: self.id.clone(),
            kind: self.kind,
            track: self.track.track().clone(),
            paused: self.paused.load(Ordering::SeqCst),
        }
    }

    fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
        self.engine.close();
    }
}

enum Slot {
    Pending {
        ticket: u64,
        track: Option<OwnedTrack>,
    },
    Active(Arc<ProducerEntry>),
}

#[derive(Default)]
struct Slots {
    closed: bool,
    next_ticket: u64,
    by_kind: HashMap<MediaKind, Slot>,
}

/// Claim on a media kind; released on drop unless the produce completed
pub struct Reservation {
    slots: Arc<Mutex<Slots>>,
    kind: MediaKind,
    ticket: u64,
}

impl Reservation {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    fn owns(&self, slot: Option<&Slot>) -> bool {
        matches!(slot, Some(Slot::Pending { ticket, .. }) if *ticket == self.ticket)
    }

    /// Park the track in the slot. Gives it back if the slot is gone.
    fn attach(&self, track: OwnedTrack) -> std::result::Result<(), OwnedTrack> {
        let mut slots = self.slots.lock();
        match slots.by_kind.get_mut(&self.kind) {
            Some(Slot::Pending { ticket, track: parked }) if *ticket == self.ticket => {
                *parked = Some(track);
                Ok(())
            }
            _ => Err(track),
        }
    }

    /// Turn the claim into an active producer
    fn activate(
        &self,
        engine: Arc<dyn EngineProducer>,
    ) -> std::result::Result<Arc<ProducerEntry>, Arc<dyn EngineProducer>> {
        let mut slots = self.slots.lock();
        if !self.owns(slots.by_kind.get(&self.kind)) {
            return Err(engine);
        }
        let Some(Slot::Pending {
            track: Some(track), ..
        }) = slots.by_kind.remove(&self.kind)
        else {
            return Err(engine);
        };

        let entry = Arc::new(ProducerEntry {
            id: engine.id(),
            kind: self.kind,
            track,
            engine,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            op_lock: tokio::sync::Mutex::new(()),
        });
        slots
            .by_kind
            .insert(self.kind, Slot::Active(entry.clone()));
        Ok(entry)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let released = {
            let mut slots = self.slots.lock();
            if self.owns(slots.by_kind.get(&self.kind)) {
                slots.by_kind.remove(&self.kind)
            } else {
                None
            }
        };
        // The parked track stops here, outside the lock
        drop(released);
    }
}

pub struct ProducerRegistry {
    channel: Arc<SignalingChannel>,
    slots: Arc<Mutex<Slots>>,
    ready_timeout: Duration,
}

impl ProducerRegistry {
    /// `ready_timeout` bounds the wait for a connecting send transport
    pub fn new(channel: Arc<SignalingChannel>, ready_timeout: Duration) -> Self {
        Self {
            channel,
            slots: Arc::new(Mutex::new(Slots::default())),
            ready_timeout,
        }
    }

    /// Claim `kind`. Fails while a producer of that kind exists or is being created.
    pub fn reserve(&self, kind: MediaKind) -> Result<Reservation> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(Error::Cancelled);
        }
        if slots.by_kind.contains_key(&kind) {
            return Err(Error::AlreadyProducing(kind));
        }

        slots.next_ticket += 1;
        let ticket = slots.next_ticket;
        slots.by_kind.insert(
            kind,
            Slot::Pending {
                ticket,
                track: None,
            },
        );
        Ok(Reservation {
            slots: self.slots.clone(),
            kind,
            ticket,
        })
    }

    /// Send `track` on `transport`. The producer exists once the server
    /// returned its id.
    pub async fn produce(
        &self,
        reservation: Reservation,
        transport: &TransportHandle,
        track: OwnedTrack,
        params: ProduceParams,
    ) -> Result<Producer> {
        let kind = reservation.kind();
        let engine_track = track.track().clone();
        if let Err(track) = reservation.attach(track) {
            track.stop();
            return Err(Error::Cancelled);
        }

        transport.wait_usable(self.ready_timeout).await?;

        let engine = transport
            .engine()
            .produce(ProduceOptions {
                track: engine_track,
                codec: params.codec,
                encodings: params.encodings,
                codec_options: params.codec_options,
            })
            .await?;

        match reservation.activate(engine) {
            Ok(entry) => {
                info!(producer_id = %entry.id, kind = %kind, "Producer created");
                Ok(entry.snapshot())
            }
            Err(engine) => {
                // Closed or disabled while the server was answering
                debug!(producer_id = %engine.id(), kind = %kind, "Discarding late producer");
                engine.close();
                self.notify_server(CLOSE_PRODUCER, &engine.id()).await;
                Err(Error::Cancelled)
            }
        }
    }

    fn active(&self, kind: MediaKind) -> Option<Arc<ProducerEntry>> {
        match self.slots.lock().by_kind.get(&kind) {
            Some(Slot::Active(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get(&self, kind: MediaKind) -> Option<Producer> {
        self.active(kind).map(|entry| entry.snapshot())
    }

    /// Number of kinds that are producing or being produced
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().by_kind.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn pause(&self, kind: MediaKind) -> Result<()> {
        self.set_paused(kind, true).await
    }

    pub async fn resume(&self, kind: MediaKind) -> Result<()> {
        self.set_paused(kind, false).await
    }

    async fn set_paused(&self, kind: MediaKind, paused: bool) -> Result<()> {
        let entry = self.active(kind).ok_or(Error::NotProducing(kind))?;
        let _op = entry.op_lock.lock().await;
        if entry.closed.load(Ordering::SeqCst) {
            return Err(Error::NotProducing(kind));
        }
        if entry.paused.swap(paused, Ordering::SeqCst) == paused {
            return Ok(());
        }

        let method = if paused {
            entry.engine.pause();
            PAUSE_PRODUCER
        } else {
            entry.engine.resume();
            RESUME_PRODUCER
        };
        debug!(producer_id = %entry.id, kind = %kind, paused, "Producer pause state changed");
        self.notify_server(method, &entry.id).await;
        Ok(())
    }

    /// Stop the track and close the producer for `kind`. Cancels a produce
    /// still in flight. Returns whether anything was closed.
    pub async fn close(&self, kind: MediaKind) -> bool {
        let entry = {
            let mut slots = self.slots.lock();
            match slots.by_kind.get(&kind) {
                Some(Slot::Active(entry)) => entry.clone(),
                Some(Slot::Pending { .. }) => {
                    let pending = slots.by_kind.remove(&kind);
                    drop(slots);
                    drop(pending);
                    debug!(kind = %kind, "Cancelled pending producer");
                    return true;
                }
                None => return false,
            }
        };

        let _op = entry.op_lock.lock().await;
        if entry.closed.load(Ordering::SeqCst) {
            return false;
        }
        entry.release();
        {
            let mut slots = self.slots.lock();
            if matches!(slots.by_kind.get(&kind), Some(Slot::Active(current)) if Arc::ptr_eq(current, &entry))
            {
                slots.by_kind.remove(&kind);
            }
        }

        info!(producer_id = %entry.id, kind = %kind, "Producer closed");
        self.notify_server(CLOSE_PRODUCER, &entry.id).await;
        true
    }

    /// Release every producer and refuse new ones. The server learns about
    /// it when the transport closes.
    pub fn close_all(&self) {
        let drained = {
            let mut slots = self.slots.lock();
            slots.closed = true;
            std::mem::take(&mut slots.by_kind)
        };

        for (_, slot) in drained {
            match slot {
                Slot::Pending { track, .. } => drop(track),
                Slot::Active(entry) => entry.release(),
            }
        }
    }

    async fn notify_server(&self, method: &str, producer_id: &ProducerId) {
        let request = ProducerIdRequest {
            producer_id: producer_id.to_string(),
        };
        if let Err(e) = self.channel.request_ack(method, &request).await {
            warn!(producer_id = %producer_id, method, error = %e, "Producer update not acknowledged");
        }
    }
}
