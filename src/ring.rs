/*!
# Shared Receive Ring

The receive ring is a fixed, power-of-two array of 8-byte slots living in
memory shared with the backend. Each slot is used twice per round trip: the
frontend writes a request (`id` + grant reference of an empty page) and the
backend later overwrites the very same slot with a response describing what it
put into that page.

```text
 request   | id: u16 | pad: u16 | gref: u32                                  |
 response  | id: u16 | offset: u16 | flags: u16 | status: i16               |
 extra     | type: u8 | flags: u8 | gso_size: u16 | gso_type: u8 | pad: u8 | features: u16 |
```

All fields are little-endian. Four free-running 32-bit counters sit next to
the slots:

- `req_prod`  - requests published by the frontend
- `req_event` - the backend wants a notification once `req_prod` passes this
- `rsp_prod`  - responses published by the backend
- `rsp_event` - the frontend wants a notification once `rsp_prod` passes this

Counters only ever grow (wrapping), a slot is addressed by `counter & (depth - 1)`.
[`FrontRing`] holds the frontend's private producer/consumer state and
[`BackRing`] the backend's; the latter is what a backend implementation (or
a test harness) uses to answer requests.
*/

use std::io;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::buffer::GrantRef;

/// Checksum intentionally left blank by the sender.
pub const RX_FLAG_CSUM_BLANK: u16 = 1 << 0;
/// Sender asserts the transport checksum is valid.
pub const RX_FLAG_DATA_VALIDATED: u16 = 1 << 1;
/// The frame continues in the next response.
pub const RX_FLAG_MORE_DATA: u16 = 1 << 2;
/// An extra-info record follows in the next slot.
pub const RX_FLAG_EXTRA_INFO: u16 = 1 << 3;

/// Extra-info record type carrying GSO metadata.
pub const EXTRA_TYPE_GSO: u8 = 1;
/// Another extra-info record follows this one.
pub const EXTRA_FLAG_MORE: u8 = 1 << 0;
/// GSO type: TCP over IPv4.
pub const GSO_TYPE_TCPV4: u8 = 1;

/// Size in bytes of one ring slot.
pub const SLOT_SIZE: usize = 8;

/// A receive request: "here is an empty page, fill it".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxRequest {
    pub id: u16,
    pub gref: GrantRef,
}

impl RxRequest {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut slot = [0u8; SLOT_SIZE];
        LittleEndian::write_u16(&mut slot[0..2], self.id);
        LittleEndian::write_u32(&mut slot[4..8], self.gref.0);
        slot
    }

    pub fn decode(slot: &[u8; SLOT_SIZE]) -> RxRequest {
        RxRequest {
            id: LittleEndian::read_u16(&slot[0..2]),
            gref: GrantRef(LittleEndian::read_u32(&slot[4..8])),
        }
    }
}

/// A receive response. `status` is the byte count on success, negative on error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: u16,
    pub status: i16,
}

impl RxResponse {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut slot = [0u8; SLOT_SIZE];
        LittleEndian::write_u16(&mut slot[0..2], self.id);
        LittleEndian::write_u16(&mut slot[2..4], self.offset);
        LittleEndian::write_u16(&mut slot[4..6], self.flags);
        LittleEndian::write_i16(&mut slot[6..8], self.status);
        slot
    }

    pub fn decode(slot: &[u8; SLOT_SIZE]) -> RxResponse {
        RxResponse {
            id: LittleEndian::read_u16(&slot[0..2]),
            offset: LittleEndian::read_u16(&slot[2..4]),
            flags: LittleEndian::read_u16(&slot[4..6]),
            status: LittleEndian::read_i16(&slot[6..8]),
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Out-of-band record occupying a response slot after `RX_FLAG_EXTRA_INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub kind: u8,
    pub flags: u8,
    pub gso_size: u16,
    pub gso_type: u8,
    pub gso_features: u16,
}

impl ExtraInfo {
    pub fn gso_tcpv4(mss: u16) -> ExtraInfo {
        ExtraInfo {
            kind: EXTRA_TYPE_GSO,
            flags: 0,
            gso_size: mss,
            gso_type: GSO_TYPE_TCPV4,
            gso_features: 0,
        }
    }

    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut slot = [0u8; SLOT_SIZE];
        slot[0] = self.kind;
        slot[1] = self.flags;
        LittleEndian::write_u16(&mut slot[2..4], self.gso_size);
        slot[4] = self.gso_type;
        LittleEndian::write_u16(&mut slot[6..8], self.gso_features);
        slot
    }

    pub fn decode(slot: &[u8; SLOT_SIZE]) -> ExtraInfo {
        ExtraInfo {
            kind: slot[0],
            flags: slot[1],
            gso_size: LittleEndian::read_u16(&slot[2..4]),
            gso_type: slot[4],
            gso_features: LittleEndian::read_u16(&slot[6..8]),
        }
    }

    pub fn more(&self) -> bool {
        self.flags & EXTRA_FLAG_MORE != 0
    }
}

/// The memory shared between frontend and backend.
pub struct SharedRing {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
    slots: Box<[AtomicU64]>,
}

impl SharedRing {
    /// Creates an initialized ring of `depth` slots.
    ///
    /// # Errors
    ///
    /// `depth` must be a non-zero power of two no larger than 65536 (ids are 16 bits).
    pub fn new(depth: usize) -> io::Result<SharedRing> {
        if depth == 0 || !depth.is_power_of_two() || depth > u16::MAX as usize + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring depth must be a power of two <= 65536",
            ));
        }
        let slots = (0..depth).map(|_| AtomicU64::new(0)).collect();
        Ok(SharedRing {
            req_prod: AtomicU32::new(0),
            req_event: AtomicU32::new(1),
            rsp_prod: AtomicU32::new(0),
            rsp_event: AtomicU32::new(1),
            slots,
        })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn req_prod(&self) -> u32 {
        self.req_prod.load(Ordering::Acquire)
    }

    pub fn req_event(&self) -> u32 {
        self.req_event.load(Ordering::Acquire)
    }

    pub fn set_req_event(&self, val: u32) {
        self.req_event.store(val, Ordering::Release);
    }

    pub fn rsp_prod(&self) -> u32 {
        self.rsp_prod.load(Ordering::Acquire)
    }

    pub fn rsp_event(&self) -> u32 {
        self.rsp_event.load(Ordering::Acquire)
    }

    fn init(&self) {
        self.req_prod.store(0, Ordering::Relaxed);
        self.rsp_prod.store(0, Ordering::Relaxed);
        self.req_event.store(1, Ordering::Relaxed);
        self.rsp_event.store(1, Ordering::Relaxed);
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    fn mask(&self, idx: u32) -> usize {
        idx as usize & (self.slots.len() - 1)
    }

    fn read_slot(&self, idx: u32) -> [u8; SLOT_SIZE] {
        self.slots[self.mask(idx)]
            .load(Ordering::Relaxed)
            .to_le_bytes()
    }

    fn write_slot(&self, idx: u32, slot: [u8; SLOT_SIZE]) {
        self.slots[self.mask(idx)].store(u64::from_le_bytes(slot), Ordering::Relaxed);
    }
}

/// `true` when moving a producer from `old` to `new` crossed `event`.
fn crosses_event(old: u32, new: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

/// Frontend (guest driver) side of the ring.
pub(crate) struct FrontRing {
    shared: Arc<SharedRing>,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    pub(crate) fn new(shared: Arc<SharedRing>) -> FrontRing {
        let req_prod_pvt = shared.req_prod();
        let rsp_cons = shared.rsp_prod();
        FrontRing {
            shared,
            req_prod_pvt,
            rsp_cons,
        }
    }

    pub(crate) fn req_prod_pvt(&self) -> u32 {
        self.req_prod_pvt
    }

    pub(crate) fn rsp_cons(&self) -> u32 {
        self.rsp_cons
    }

    /// Requests posted and not yet answered by a consumed response.
    pub(crate) fn outstanding(&self) -> u32 {
        self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    pub(crate) fn slot_id(&self, idx: u32) -> u16 {
        self.shared.mask(idx) as u16
    }

    pub(crate) fn write_request(&mut self, req: RxRequest) {
        self.shared.write_slot(self.req_prod_pvt, req.encode());
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
    }

    /// Publishes all privately produced requests.
    ///
    /// Returns whether the backend asked to be notified about them.
    pub(crate) fn push_requests(&mut self) -> bool {
        let old = self.shared.req_prod.load(Ordering::Relaxed);
        let new = self.req_prod_pvt;
        // slots must be visible before the producer moves
        fence(Ordering::Release);
        self.shared.req_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        crosses_event(old, new, self.shared.req_event())
    }

    /// The response producer published by the backend.
    pub(crate) fn rsp_prod(&self) -> u32 {
        self.shared.rsp_prod()
    }

    pub(crate) fn response(&self, idx: u32) -> RxResponse {
        RxResponse::decode(&self.shared.read_slot(idx))
    }

    pub(crate) fn extra_info(&self, idx: u32) -> ExtraInfo {
        ExtraInfo::decode(&self.shared.read_slot(idx))
    }

    pub(crate) fn set_rsp_cons(&mut self, cons: u32) {
        self.rsp_cons = cons;
    }

    pub(crate) fn unconsumed_responses(&self) -> u32 {
        self.shared.rsp_prod().wrapping_sub(self.rsp_cons)
    }

    /// Asks for the next notification once `threshold` more responses are
    /// published, then re-checks so a response racing the update is not missed.
    ///
    /// Returns `true` when any response is already waiting. Those were
    /// published before the new event index, so their producer did not
    /// notify and the caller has to run again.
    pub(crate) fn arm_response_event(&mut self, threshold: u32) -> bool {
        self.shared
            .rsp_event
            .store(self.rsp_cons.wrapping_add(threshold), Ordering::Release);
        fence(Ordering::SeqCst);
        self.unconsumed_responses() > 0
    }

    /// Re-initializes the shared page and forgets every private index; used
    /// while the backend is disconnected.
    pub(crate) fn reset(&mut self) {
        self.shared.init();
        self.req_prod_pvt = 0;
        self.rsp_cons = 0;
    }
}

/// Backend (virtual switch) side of the ring.
pub struct BackRing {
    shared: Arc<SharedRing>,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl BackRing {
    pub fn new(shared: Arc<SharedRing>) -> BackRing {
        let req_cons = shared.req_prod();
        let rsp_prod_pvt = shared.rsp_prod();
        BackRing {
            shared,
            req_cons,
            rsp_prod_pvt,
        }
    }

    pub fn shared(&self) -> &Arc<SharedRing> {
        &self.shared
    }

    pub fn unconsumed_requests(&self) -> u32 {
        self.shared.req_prod().wrapping_sub(self.req_cons)
    }

    /// Takes the next posted request, returning it with its ring index.
    pub fn next_request(&mut self) -> Option<(u32, RxRequest)> {
        if self.unconsumed_requests() == 0 {
            return None;
        }
        let idx = self.req_cons;
        let req = RxRequest::decode(&self.shared.read_slot(idx));
        self.req_cons = self.req_cons.wrapping_add(1);
        Some((idx, req))
    }

    /// Writes a response into the next response slot.
    pub fn put_response(&mut self, rsp: RxResponse) {
        self.shared.write_slot(self.rsp_prod_pvt, rsp.encode());
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Writes an extra-info record into the next response slot.
    pub fn put_extra_info(&mut self, info: ExtraInfo) {
        self.shared.write_slot(self.rsp_prod_pvt, info.encode());
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Publishes written responses; returns whether the frontend wants an event.
    pub fn push_responses(&mut self) -> bool {
        let old = self.shared.rsp_prod.load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        fence(Ordering::Release);
        self.shared.rsp_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        crosses_event(old, new, self.shared.rsp_event())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_layout_is_little_endian() {
        let rsp = RxResponse {
            id: 0x0102,
            offset: 0x0304,
            flags: RX_FLAG_MORE_DATA | RX_FLAG_CSUM_BLANK,
            status: -2,
        };
        assert_eq!(rsp.encode(), [0x02, 0x01, 0x04, 0x03, 0x05, 0x00, 0xfe, 0xff]);
        assert_eq!(RxResponse::decode(&rsp.encode()), rsp);

        let req = RxRequest {
            id: 7,
            gref: GrantRef(0xdead_beef),
        };
        assert_eq!(req.encode(), [7, 0, 0, 0, 0xef, 0xbe, 0xad, 0xde]);

        let extra = ExtraInfo::gso_tcpv4(1460);
        assert_eq!(extra.encode(), [1, 0, 0xb4, 0x05, 1, 0, 0, 0]);
    }

    #[test]
    fn rejects_bad_depth() {
        assert!(SharedRing::new(0).is_err());
        assert!(SharedRing::new(100).is_err());
        assert!(SharedRing::new(256).is_ok());
    }

    #[test]
    fn event_crossing_handles_wrap() {
        assert!(crosses_event(0, 1, 1));
        assert!(!crosses_event(1, 2, 5));
        assert!(crosses_event(u32::MAX - 1, 2, u32::MAX));
        assert!(!crosses_event(u32::MAX - 1, 2, 10));
    }

    #[test]
    fn request_publish_notifies_once_past_event() {
        let shared = Arc::new(SharedRing::new(8).unwrap());
        let mut front = FrontRing::new(shared.clone());
        let mut back = BackRing::new(shared.clone());

        front.write_request(RxRequest {
            id: 0,
            gref: GrantRef(11),
        });
        // req_event starts at 1
        assert!(front.push_requests());
        assert_eq!(back.next_request().map(|(_, r)| r.gref), Some(GrantRef(11)));

        shared.set_req_event(10);
        front.write_request(RxRequest {
            id: 1,
            gref: GrantRef(12),
        });
        assert!(!front.push_requests());
        assert_eq!(front.outstanding(), 2);
    }

    #[test]
    fn response_event_recheck_sees_late_arrival() {
        let shared = Arc::new(SharedRing::new(8).unwrap());
        let mut front = FrontRing::new(shared.clone());
        let mut back = BackRing::new(shared.clone());
        assert!(!front.arm_response_event(4));
        back.put_response(RxResponse::default());
        // threshold of 4 not reached yet
        assert!(!back.push_responses());
        // one response is waiting, so a new threshold must not hide it
        assert!(front.arm_response_event(4));
        assert_eq!(shared.rsp_event(), 4);
        assert!(front.arm_response_event(1));
        assert_eq!(shared.rsp_event(), 1);
    }
}
