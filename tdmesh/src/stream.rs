//! Master-side stream admission control.
//!
//! The [`StreamCollection`] is the authoritative map of servers and streams.
//! It is fed stream management elements collected during the uplink phase
//! and reconciled with each new schedule:
//!
//! ```text
//!            CONNECT (server present,           schedule contains id
//!            directions match)                  (ESTABLISH)
//!   absent ───────────────────────▶ ACCEPTED ─────────────────────▶ ESTABLISHED
//!                                      │                                │
//!                     CLOSED, or       │                                │ CLOSED, or
//!                     missing from     ▼                                ▼ missing from
//!                     schedule      removed                          removed   schedule
//!                     (REJECT)                                                 (CLOSE)
//! ```
//!
//! Servers have the single status `Listen` and are never affected by
//! schedules. Notifications for the nodes (server opened or closed, stream
//! rejected) are queued as [`InfoElement`]s.
//!
//! # Example
//!
//! ```
//! use tdmesh::config::DefaultConfig;
//! use tdmesh::stream::{MasterStreamStatus, StreamAdmitter, StreamCollection};
//! use tdmesh::types::{Direction, Period, Redundancy, StreamId, StreamParameters};
//! use tdmesh::wire::{SmeType, StreamManagementElement};
//!
//! let collection = StreamCollection::new::<DefaultConfig>();
//! let params = StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Up);
//! let server = StreamId::server(3, 1);
//! let client = StreamId::new(5, 3, 2, 1);
//!
//! collection.receive_smes(&[
//!     StreamManagementElement::new(server, params, SmeType::Listen),
//!     StreamManagementElement::new(client, params, SmeType::Connect),
//! ]);
//! let accepted = collection.streams_with_status(MasterStreamStatus::Accepted);
//! assert_eq!(accepted.len(), 1);
//! assert_eq!(accepted[0].id, client);
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;

use crate::collections::{Enqueued, SharedMutex, UpdatableQueue};
use crate::config::MacConfig;
use crate::schedule::ScheduleElement;
use crate::types::{Period, Redundancy, StreamId, StreamParameters};
use crate::wire::{SmeType, StreamManagementElement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterStreamStatus {
    /// Stream admitted, waiting for a schedule.
    Accepted,
    /// Stream present in the current schedule.
    Established,
    /// Server waiting for clients.
    Listen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterStreamInfo {
    pub id: StreamId,
    pub params: StreamParameters,
    pub status: MasterStreamStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoType {
    ServerOpened,
    ServerClosed,
    StreamReject,
}

/// One-shot notification from the master to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoElement {
    pub id: StreamId,
    pub kind: InfoType,
}

/// Reconciliation of one stream with a new schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChange {
    Establish,
    Reject,
    Close,
}

/// Sticky flags telling the schedule driver what happened since the last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionFlags {
    pub added: bool,
    pub modified: bool,
    pub removed: bool,
    pub resend: bool,
}

/// Stream admission as seen by the uplink phase and the schedule driver.
pub trait StreamAdmitter {
    /// Apply elements in order.
    fn receive_smes(&self, smes: &[StreamManagementElement]);

    fn streams(&self) -> Vec<MasterStreamInfo>;

    /// Changes a schedule would cause, without applying them.
    fn stream_changes(&self, schedule: &[ScheduleElement]) -> BTreeMap<StreamId, StreamChange>;

    fn apply_changes(&self, changes: &BTreeMap<StreamId, StreamChange>);
}

/// Server and client agree on the least demanding combination.
///
/// Lower redundancy, longer period, smaller payload. The directions already
/// match, so the client's is kept.
pub fn negotiate_parameters(
    server: &StreamParameters,
    client: &StreamParameters,
) -> StreamParameters {
    let redundancy = Redundancy::from_ordinal(
        server.redundancy.ordinal().min(client.redundancy.ordinal()),
    )
    .unwrap_or_default();
    let period =
        Period::from_ordinal(server.period.ordinal().max(client.period.ordinal())).unwrap_or_default();
    StreamParameters::new(
        redundancy,
        period,
        server.payload_size.min(client.payload_size),
        client.direction,
    )
}

/// Diff of `streams` against `schedule`. Servers are ignored.
fn changes_for(
    streams: &BTreeMap<StreamId, MasterStreamInfo>,
    schedule: &[ScheduleElement],
) -> BTreeMap<StreamId, StreamChange> {
    let mut changes = BTreeMap::new();
    for (id, info) in streams.iter().filter(|(id, _)| id.is_stream()) {
        let scheduled = schedule.iter().any(|e| e.stream == *id);
        let change = match (info.status, scheduled) {
            (MasterStreamStatus::Accepted, true) => StreamChange::Establish,
            (MasterStreamStatus::Accepted, false) => StreamChange::Reject,
            (MasterStreamStatus::Established, false) => StreamChange::Close,
            _ => continue,
        };
        changes.insert(*id, change);
    }
    changes
}

/// Immutable copy of the collection for the schedule computation.
#[derive(Debug, Clone, Default)]
pub struct StreamSnapshot {
    streams: BTreeMap<StreamId, MasterStreamInfo>,
}

impl StreamSnapshot {
    pub fn streams(&self) -> Vec<MasterStreamInfo> {
        self.streams.values().copied().collect()
    }

    pub fn streams_with_status(&self, status: MasterStreamStatus) -> Vec<MasterStreamInfo> {
        self.streams
            .values()
            .filter(|s| s.status == status)
            .copied()
            .collect()
    }

    pub fn stream_changes(&self, schedule: &[ScheduleElement]) -> BTreeMap<StreamId, StreamChange> {
        changes_for(&self.streams, schedule)
    }
}

struct Inner {
    streams: BTreeMap<StreamId, MasterStreamInfo>,
    max_streams: usize,
    info: UpdatableQueue<StreamId, InfoElement>,
    flags: CollectionFlags,
}

impl Inner {
    fn enqueue_info(&mut self, id: StreamId, kind: InfoType) {
        if self.info.enqueue(id, InfoElement { id, kind }) == Enqueued::Rejected {
            log::warn!("info queue full, dropped {:?} for {:?}", kind, id);
        }
    }

    fn receive(&mut self, sme: &StreamManagementElement) {
        if sme.kind == SmeType::ResendSchedule {
            self.flags.resend = true;
            log::debug!("schedule resend requested by node {}", sme.id.src);
            return;
        }
        let id = sme.id;
        match (self.streams.get(&id).map(|s| s.status), id.is_stream()) {
            (Some(status), true) => self.update_stream(id, status, sme.kind),
            (Some(_), false) => self.update_server(id, sme.kind),
            (None, true) => self.create_stream(sme),
            (None, false) => self.create_server(sme),
        }
    }

    fn update_stream(&mut self, id: StreamId, status: MasterStreamStatus, kind: SmeType) {
        if kind == SmeType::Listen {
            log::error!("LISTEN element addressed to stream {:?}", id);
            return;
        }
        match (status, kind) {
            (MasterStreamStatus::Accepted | MasterStreamStatus::Established, SmeType::Closed) => {
                self.streams.remove(&id);
                self.flags.removed = true;
                self.flags.modified = true;
                log::debug!("stream {:?} closed", id);
            }
            (MasterStreamStatus::Established, SmeType::Connect) => {
                // The client missed its schedule.
                self.flags.resend = true;
            }
            (MasterStreamStatus::Listen, _) => {
                log::error!("stream {:?} in server status", id);
            }
            _ => {}
        }
    }

    fn update_server(&mut self, id: StreamId, kind: SmeType) {
        match kind {
            SmeType::Closed => {
                self.streams.remove(&id);
                self.enqueue_info(id, InfoType::ServerClosed);
                log::debug!("server {:?} closed", id);
            }
            SmeType::Listen => self.enqueue_info(id, InfoType::ServerOpened),
            _ => {}
        }
    }

    fn create_stream(&mut self, sme: &StreamManagementElement) {
        let id = sme.id;
        match sme.kind {
            SmeType::Listen => log::error!("LISTEN element addressed to stream {:?}", id),
            // Close of an unknown stream: the node still runs an old schedule.
            SmeType::Closed => self.flags.resend = true,
            SmeType::Connect => {
                let Some(server) = self.streams.get(&id.server_id()).copied() else {
                    log::debug!("stream {:?} rejected: no server", id);
                    self.enqueue_info(id, InfoType::StreamReject);
                    return;
                };
                if server.params.direction != sme.params.direction {
                    log::debug!("stream {:?} rejected: direction mismatch", id);
                    self.enqueue_info(id, InfoType::StreamReject);
                    return;
                }
                if self.streams.len() >= self.max_streams {
                    log::warn!("stream {:?} rejected: collection full", id);
                    self.enqueue_info(id, InfoType::StreamReject);
                    return;
                }
                let params = negotiate_parameters(&server.params, &sme.params);
                self.streams.insert(
                    id,
                    MasterStreamInfo {
                        id,
                        params,
                        status: MasterStreamStatus::Accepted,
                    },
                );
                self.flags.added = true;
                self.flags.modified = true;
                log::debug!("stream {:?} accepted", id);
            }
            SmeType::ResendSchedule => {}
        }
    }

    fn create_server(&mut self, sme: &StreamManagementElement) {
        let id = sme.id;
        match sme.kind {
            SmeType::Listen => {
                if id != StreamId::server(id.src, id.dst_port) {
                    log::error!("server {:?} ignored: source port set", id);
                    return;
                }
                if self.streams.len() >= self.max_streams {
                    log::warn!("server {:?} ignored: collection full", id);
                    return;
                }
                self.streams.insert(
                    id,
                    MasterStreamInfo {
                        id,
                        params: sme.params,
                        status: MasterStreamStatus::Listen,
                    },
                );
                self.enqueue_info(id, InfoType::ServerOpened);
                log::debug!("server {:?} opened", id);
            }
            SmeType::Closed => self.enqueue_info(id, InfoType::ServerClosed),
            _ => {}
        }
    }

    fn apply(&mut self, changes: &BTreeMap<StreamId, StreamChange>) {
        for (id, change) in changes.iter().filter(|(id, _)| id.is_stream()) {
            let Some(status) = self.streams.get(id).map(|s| s.status) else {
                continue;
            };
            match (change, status) {
                (StreamChange::Establish, MasterStreamStatus::Accepted) => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.status = MasterStreamStatus::Established;
                    }
                }
                (StreamChange::Reject, MasterStreamStatus::Accepted) => {
                    self.streams.remove(id);
                    self.enqueue_info(*id, InfoType::StreamReject);
                }
                (StreamChange::Close, MasterStreamStatus::Established) => {
                    self.streams.remove(id);
                }
                _ => {}
            }
        }
    }
}

/// The master's stream and server table.
///
/// Created once at master startup. Every public call holds the lock for its
/// whole duration.
pub struct StreamCollection {
    inner: Mutex<SharedMutex, RefCell<Inner>>,
}

impl core::fmt::Debug for StreamCollection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamCollection")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl StreamCollection {
    pub fn new<C: MacConfig>() -> Self {
        Self::with_limits(C::MAX_STREAMS, C::MAX_INFO_ELEMENTS)
    }

    pub fn with_limits(max_streams: usize, max_info_elements: usize) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                streams: BTreeMap::new(),
                max_streams,
                info: UpdatableQueue::with_max_capacity(max_info_elements),
                flags: CollectionFlags::default(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().streams.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: StreamId) -> Option<MasterStreamInfo> {
        self.inner.lock(|cell| cell.borrow().streams.get(&id).copied())
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.inner.lock(|cell| StreamSnapshot {
            streams: cell.borrow().streams.clone(),
        })
    }

    pub fn streams_with_status(&self, status: MasterStreamStatus) -> Vec<MasterStreamInfo> {
        self.inner.lock(|cell| {
            cell.borrow()
                .streams
                .values()
                .filter(|s| s.status == status)
                .copied()
                .collect()
        })
    }

    /// Up to `limit` pending notifications, oldest first.
    pub fn dequeue_info(&self, limit: usize) -> Vec<InfoElement> {
        self.inner
            .lock(|cell| cell.borrow_mut().info.dequeue_up_to(limit))
    }

    pub fn pending_info(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().info.len())
    }

    /// Current flags; all are cleared.
    pub fn take_flags(&self) -> CollectionFlags {
        self.inner
            .lock(|cell| core::mem::take(&mut cell.borrow_mut().flags))
    }

    /// Diff and apply `schedule` under one lock acquisition.
    pub fn apply_schedule(&self, schedule: &[ScheduleElement]) -> BTreeMap<StreamId, StreamChange> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let changes = changes_for(&inner.streams, schedule);
            inner.apply(&changes);
            changes
        })
    }
}

impl StreamAdmitter for StreamCollection {
    fn receive_smes(&self, smes: &[StreamManagementElement]) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            for sme in smes {
                inner.receive(sme);
            }
        })
    }

    fn streams(&self) -> Vec<MasterStreamInfo> {
        self.inner
            .lock(|cell| cell.borrow().streams.values().copied().collect())
    }

    fn stream_changes(&self, schedule: &[ScheduleElement]) -> BTreeMap<StreamId, StreamChange> {
        self.inner
            .lock(|cell| changes_for(&cell.borrow().streams, schedule))
    }

    fn apply_changes(&self, changes: &BTreeMap<StreamId, StreamChange>) {
        self.inner.lock(|cell| cell.borrow_mut().apply(changes))
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::config::{DefaultConfig, SmallConfig};
    use crate::schedule::Action;
    use crate::types::Direction;

    const SERVER: StreamId = StreamId::server(3, 1);
    const CLIENT: StreamId = StreamId::new(5, 3, 2, 1);

    fn params(direction: Direction) -> StreamParameters {
        StreamParameters::new(Redundancy::Double, Period::P5, 30, direction)
    }

    fn sme(id: StreamId, params: StreamParameters, kind: SmeType) -> StreamManagementElement {
        StreamManagementElement::new(id, params, kind)
    }

    fn scheduled(id: StreamId) -> Vec<ScheduleElement> {
        vec![ScheduleElement::new(id.src, 0, Action::SendStream, id)]
    }

    fn with_server(direction: Direction) -> StreamCollection {
        let c = StreamCollection::new::<DefaultConfig>();
        c.receive_smes(&[sme(SERVER, params(direction), SmeType::Listen)]);
        c.dequeue_info(8);
        c.take_flags();
        c
    }

    #[test]
    fn test_negotiation() {
        let server = StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Down);
        let client = StreamParameters::new(Redundancy::Double, Period::P5, 30, Direction::Down);
        assert_eq!(
            negotiate_parameters(&server, &client),
            StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Down)
        );
        assert_eq!(
            negotiate_parameters(&client, &server),
            negotiate_parameters(&server, &client)
        );
    }

    #[test]
    fn test_connect_without_server_rejected() {
        let c = StreamCollection::new::<DefaultConfig>();
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Connect)]);
        assert!(c.is_empty());
        assert_eq!(
            c.dequeue_info(8),
            vec![InfoElement {
                id: CLIENT,
                kind: InfoType::StreamReject
            }]
        );
        assert_eq!(c.take_flags(), CollectionFlags::default());
    }

    #[test]
    fn test_connect_direction_mismatch_rejected() {
        let c = with_server(Direction::Up);
        c.receive_smes(&[sme(CLIENT, params(Direction::Down), SmeType::Connect)]);
        assert_eq!(c.len(), 1);
        assert!(c.get(CLIENT).is_none());
        assert_eq!(
            c.dequeue_info(8),
            vec![InfoElement {
                id: CLIENT,
                kind: InfoType::StreamReject
            }]
        );
    }

    #[test]
    fn test_stream_lifecycle_round_trip() {
        let c = StreamCollection::new::<DefaultConfig>();
        let server_params = StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Up);
        c.receive_smes(&[
            sme(SERVER, server_params, SmeType::Listen),
            sme(CLIENT, params(Direction::Up), SmeType::Connect),
        ]);
        assert_eq!(
            c.dequeue_info(8),
            vec![InfoElement {
                id: SERVER,
                kind: InfoType::ServerOpened
            }]
        );
        let flags = c.take_flags();
        assert!(flags.added && flags.modified && !flags.removed);

        let accepted = c.get(CLIENT).unwrap();
        assert_eq!(accepted.status, MasterStreamStatus::Accepted);
        assert_eq!(
            accepted.params,
            StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Up)
        );

        let changes = c.stream_changes(&scheduled(CLIENT));
        assert_eq!(changes, BTreeMap::from([(CLIENT, StreamChange::Establish)]));
        c.apply_changes(&changes);
        assert_eq!(c.get(CLIENT).unwrap().status, MasterStreamStatus::Established);

        let changes = c.stream_changes(&[]);
        assert_eq!(changes, BTreeMap::from([(CLIENT, StreamChange::Close)]));
        c.apply_changes(&changes);
        assert!(c.get(CLIENT).is_none());
        // Closing through the schedule sends no notice; the server stays.
        assert_eq!(c.pending_info(), 0);
        assert!(c.get(SERVER).is_some());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let c = with_server(Direction::Up);
        let other = StreamId::new(6, 3, 0, 1);
        c.receive_smes(&[
            sme(CLIENT, params(Direction::Up), SmeType::Connect),
            sme(other, params(Direction::Up), SmeType::Connect),
        ]);
        let changes = c.stream_changes(&scheduled(CLIENT));
        assert_eq!(changes.get(&other), Some(&StreamChange::Reject));

        c.apply_changes(&changes);
        let once = c.streams();
        let info_once = c.pending_info();
        c.apply_changes(&changes);
        assert_eq!(c.streams(), once);
        assert_eq!(c.pending_info(), info_once);
        assert_eq!(info_once, 1);
        assert_eq!(c.get(CLIENT).unwrap().status, MasterStreamStatus::Established);
    }

    #[test]
    fn test_stream_changes_is_read_only() {
        let c = with_server(Direction::Up);
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Connect)]);
        let before = c.streams();
        let _ = c.stream_changes(&[]);
        assert_eq!(c.streams(), before);
        assert_eq!(c.snapshot().stream_changes(&[]), c.stream_changes(&[]));
    }

    #[test]
    fn test_close_paths() {
        let c = with_server(Direction::Up);
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Connect)]);
        c.take_flags();

        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Closed)]);
        assert!(c.get(CLIENT).is_none());
        let flags = c.take_flags();
        assert!(flags.removed && flags.modified);

        // Closing an unknown stream asks for the schedule again.
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Closed)]);
        assert!(c.take_flags().resend);

        c.receive_smes(&[sme(SERVER, params(Direction::Up), SmeType::Closed)]);
        assert!(c.is_empty());
        assert_eq!(
            c.dequeue_info(8),
            vec![InfoElement {
                id: SERVER,
                kind: InfoType::ServerClosed
            }]
        );
    }

    #[test]
    fn test_server_notices() {
        let c = with_server(Direction::Up);
        c.receive_smes(&[sme(SERVER, params(Direction::Up), SmeType::Listen)]);
        assert_eq!(c.dequeue_info(8)[0].kind, InfoType::ServerOpened);

        let absent = StreamId::server(9, 4);
        c.receive_smes(&[sme(absent, params(Direction::Up), SmeType::Closed)]);
        assert_eq!(c.dequeue_info(8)[0].kind, InfoType::ServerClosed);
        assert!(c.get(absent).is_none());
    }

    #[test]
    fn test_listen_on_stream_id_ignored() {
        let c = with_server(Direction::Up);
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Listen)]);
        assert!(c.get(CLIENT).is_none());
        assert_eq!(c.take_flags(), CollectionFlags::default());
        assert_eq!(c.pending_info(), 0);
    }

    #[test]
    fn test_listen_with_source_port_ignored() {
        let c = StreamCollection::new::<DefaultConfig>();
        let odd = StreamId::new(3, 3, 2, 1);
        c.receive_smes(&[sme(odd, params(Direction::Up), SmeType::Listen)]);
        assert!(c.is_empty());
        assert_eq!(c.pending_info(), 0);

        // A CONNECT to that port still finds no server.
        c.receive_smes(&[sme(CLIENT, params(Direction::Up), SmeType::Connect)]);
        assert_eq!(c.dequeue_info(8)[0].kind, InfoType::StreamReject);
    }

    #[test]
    fn test_apply_schedule_diffs_live_table() {
        let c = with_server(Direction::Up);
        let other = StreamId::new(6, 3, 0, 1);
        c.receive_smes(&[
            sme(CLIENT, params(Direction::Up), SmeType::Connect),
            sme(other, params(Direction::Up), SmeType::Connect),
        ]);
        let changes = c.apply_schedule(&scheduled(CLIENT));
        assert_eq!(
            changes,
            BTreeMap::from([
                (CLIENT, StreamChange::Establish),
                (other, StreamChange::Reject)
            ])
        );
        assert_eq!(c.get(CLIENT).unwrap().status, MasterStreamStatus::Established);
        assert!(c.get(other).is_none());
        assert_eq!(c.dequeue_info(8)[0].kind, InfoType::StreamReject);
    }

    #[test]
    fn test_resend_request() {
        let c = StreamCollection::new::<SmallConfig>();
        c.receive_smes(&[sme(
            StreamId::new(4, 0, 0, 0),
            StreamParameters::default(),
            SmeType::ResendSchedule,
        )]);
        assert!(c.take_flags().resend);
        assert!(!c.take_flags().resend);
    }

    #[test]
    fn test_collection_bound() {
        let c = StreamCollection::with_limits(2, 8);
        c.receive_smes(&[sme(SERVER, params(Direction::Up), SmeType::Listen)]);
        c.receive_smes(&[
            sme(CLIENT, params(Direction::Up), SmeType::Connect),
            sme(StreamId::new(6, 3, 0, 1), params(Direction::Up), SmeType::Connect),
        ]);
        assert_eq!(c.len(), 2);
        let rejects = c
            .dequeue_info(8)
            .into_iter()
            .filter(|i| i.kind == InfoType::StreamReject)
            .count();
        assert_eq!(rejects, 1);
    }
}
