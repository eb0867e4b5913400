/*!
# Receive Path

[`RxContext`] is the device context of one receive ring. It owns the
frontend side of the ring, the buffer pool, the packet pool and the
reassembly state, all behind one mutex.

A run ([`RxContext::run`]) does, under the lock:

1. continue a split that stalled for lack of buffers,
2. consume up to `response_budget` responses, folding them into frames and
   turning completed frames into packets,
3. repost empty pages up to the posted target,
4. decide when the backend should notify next.

The lock is dropped before packets are handed to the [`HostStack`], in
batches of at most `indicate_batch`. The host gives every packet back
through [`RxContext::return_packet`].

Wakes come from [`RxContext::interrupt`] (event channel) and
[`RxContext::timer_expired`] (deadline timer). Both return whether the
caller must queue a run; see [`crate::moderation`].
*/

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::buffer::{BufId, BufferCensus, GrantTable, Owner};
use crate::checksum::{transport_checksum, ChecksumMode};
use crate::config::{RxConfig, RxSettings};
use crate::error::RxError;
use crate::freelist::BufferPool;
use crate::header::{self, parse_header, ParseError, PacketInfo, ETH_HEADER_LEN};
use crate::moderation::{Ewma, SchedState, WakeSlot, WakeSource};
use crate::packet::{ChecksumInfo, PacketPool, RxPacket};
use crate::reassembly::{Frame, Reassembler};
use crate::ring::{FrontRing, RxRequest, SharedRing};
use crate::segment::{Split, Stalled};
use crate::stats::{RxStats, RxStatsSnapshot};

/// Signals the backend that new requests were posted.
pub trait EventChannel: Send + Sync {
    fn notify(&self);
}

/// The network stack received packets are delivered to.
pub trait HostStack: Send + Sync {
    /// Takes a batch of packets. Every packet must eventually come back
    /// through [`RxContext::return_packet`], which must not be called from
    /// inside this method's caller while it holds the rx lock (it never does).
    fn indicate_receive(&self, packets: Vec<RxPacket>);
}

/// What the caller has to do after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Queue another run right away.
    pub reschedule: bool,
    /// Arm the deadline timer for this long.
    pub arm_deadline: Option<Duration>,
    /// Cancel the deadline timer if it is armed.
    pub cancel_deadline: bool,
    /// Packets handed to the host stack.
    pub delivered: usize,
}

struct RxState {
    front: FrontRing,
    pool: BufferPool,
    packets: PacketPool,
    reassembler: Reassembler,
    /// Buffer posted under each request id.
    posted: Vec<Option<BufId>>,
    free_ids: u32,
    split: Option<Split>,
    ewma: Ewma,
    shutting_down: bool,
    shutdown_signalled: bool,
    disposed: bool,
    suspended: bool,
}

pub struct RxContext {
    config: RxConfig,
    state: Mutex<RxState>,
    settings: Mutex<Arc<RxSettings>>,
    wake: WakeSlot,
    deadline_armed: AtomicBool,
    stats: RxStats,
    events: Arc<dyn EventChannel>,
    host: Arc<dyn HostStack>,
    drained: Condvar,
    #[cfg(feature = "async_tokio")]
    drained_async: tokio::sync::Notify,
}

impl RxContext {
    /// Sets up the receive path on `shared` and posts the first requests.
    ///
    /// # Errors
    ///
    /// `shared` does not have the configured depth.
    pub fn new(
        config: RxConfig,
        settings: RxSettings,
        shared: Arc<SharedRing>,
        grants: Arc<dyn GrantTable>,
        events: Arc<dyn EventChannel>,
        host: Arc<dyn HostStack>,
    ) -> io::Result<RxContext> {
        if shared.depth() != config.ring_depth {
            return Err(RxError::InvalidConfig("shared ring depth differs from configuration").into());
        }
        let state = RxState {
            front: FrontRing::new(shared),
            pool: BufferPool::new(config.page_size, config.freelist_target, config.trim_cap, grants),
            packets: PacketPool::new(config.packet_pool_capacity),
            reassembler: Reassembler::default(),
            posted: vec![None; config.ring_depth],
            free_ids: config.ring_depth as u32,
            split: None,
            ewma: Ewma::default(),
            shutting_down: false,
            shutdown_signalled: false,
            disposed: false,
            suspended: false,
        };
        let ctx = RxContext {
            config,
            state: Mutex::new(state),
            settings: Mutex::new(Arc::new(settings)),
            wake: WakeSlot::default(),
            deadline_armed: AtomicBool::new(false),
            stats: RxStats::default(),
            events,
            host,
            drained: Condvar::new(),
            #[cfg(feature = "async_tokio")]
            drained_async: tokio::sync::Notify::new(),
        };
        let notify = {
            let mut guard = ctx.lock();
            ctx.replenish(&mut guard)
        };
        if notify {
            ctx.events.notify();
        }
        log::debug!(
            "rx path up: depth {} page size {}",
            ctx.config.ring_depth,
            ctx.config.page_size
        );
        Ok(ctx)
    }

    fn lock(&self) -> MutexGuard<'_, RxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RxConfig {
        &self.config
    }

    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn settings(&self) -> Arc<RxSettings> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the live settings; the next run picks them up.
    pub fn update_settings(&self, settings: RxSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Event channel interrupt. Returns `true` if the caller must queue a run.
    pub fn interrupt(&self) -> bool {
        self.wake.wake_interrupt()
    }

    /// Deadline timer fired. Returns `true` if the caller must queue a run.
    pub fn timer_expired(&self) -> bool {
        self.deadline_armed.store(false, Ordering::Release);
        self.wake.wake_timer()
    }

    pub fn sched_state(&self) -> SchedState {
        self.wake.state()
    }

    /// One deferred run: drain, replenish, re-arm, deliver.
    pub fn run(&self) -> RunOutcome {
        let source = self.wake.begin().unwrap_or(WakeSource::Interrupt);
        let settings = self.settings();
        let mut ready = Vec::new();
        let mut outcome = RunOutcome::default();

        let notify = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.shutting_down || st.suspended {
                drop(guard);
                self.wake.end();
                return outcome;
            }
            if source == WakeSource::Timer {
                st.ewma.reset();
            }
            if self.config.interrupt_moderation && self.deadline_armed.swap(false, Ordering::AcqRel) {
                outcome.cancel_deadline = true;
            }

            let mut stalled = false;
            if let Some(split) = st.split.take() {
                stalled = !self.continue_split(st, split, &settings, &mut ready);
            }
            let mut budget_hit = false;
            if !stalled {
                let (consumed, drain_stalled) =
                    self.drain(st, self.config.response_budget, &settings, &mut ready);
                stalled = drain_stalled;
                budget_hit = !stalled && consumed == self.config.response_budget;
                // a timer run starts the average over instead of feeding it
                if !budget_hit && source != WakeSource::Timer {
                    st.ewma.sample(consumed);
                }
            }
            let notify = self.replenish(st);

            if stalled {
                outcome.arm_deadline = Some(self.config.deadline);
            } else if budget_hit {
                outcome.reschedule = true;
            } else {
                let threshold = if self.config.interrupt_moderation {
                    st.ewma.threshold(self.config.event_cap)
                } else {
                    1
                };
                if st.front.arm_response_event(threshold) {
                    outcome.reschedule = true;
                } else if threshold > 1 {
                    outcome.arm_deadline = Some(self.config.deadline);
                }
            }
            if outcome.arm_deadline.is_some() {
                self.deadline_armed.store(true, Ordering::Release);
            }
            notify
        };

        self.wake.end();
        if notify {
            self.events.notify();
        }
        outcome.delivered = ready.len();
        self.deliver(ready);
        if outcome.reschedule {
            outcome.reschedule = self.wake.wake_interrupt();
        }
        outcome
    }

    fn deliver(&self, mut ready: Vec<RxPacket>) {
        while !ready.is_empty() {
            let rest = ready.split_off(ready.len().min(self.config.indicate_batch));
            let bytes: usize = ready.iter().map(RxPacket::len).sum();
            RxStats::add(&self.stats.packets, ready.len() as u64);
            RxStats::add(&self.stats.bytes, bytes as u64);
            self.host.indicate_receive(ready);
            ready = rest;
        }
    }

    /// Posts free pages until `target_posted` requests are outstanding.
    /// Returns whether the backend has to be notified.
    fn replenish(&self, st: &mut RxState) -> bool {
        if st.shutting_down || st.suspended {
            return false;
        }
        let want = self.config.target_posted.saturating_sub(st.front.outstanding());
        let mut posted = 0;
        while posted < want {
            if st.free_ids == 0 {
                log::debug!("{}: no free request id", RxError::ResourceExhaustion);
                RxStats::inc(&self.stats.exhaustion);
                break;
            }
            let Some(id) = st.pool.allocate(Owner::Posted) else {
                log::debug!(
                    "{}: posted {posted} of {want}",
                    RxError::ResourceExhaustion
                );
                RxStats::inc(&self.stats.exhaustion);
                break;
            };
            let slot = st.front.slot_id(st.front.req_prod_pvt());
            if let Some(old) = st.posted[slot as usize] {
                crate::error::defect(format_args!("request id {slot} still holds {old:?}"));
                st.pool.release(id, Owner::Posted);
                break;
            }
            st.posted[slot as usize] = Some(id);
            st.free_ids -= 1;
            st.front.write_request(RxRequest {
                id: slot,
                gref: st.pool.gref(id),
            });
            posted += 1;
        }
        posted > 0 && st.front.push_requests()
    }

    /// Consumes up to `cap` responses. Returns how many were consumed and
    /// whether a split stalled on the way.
    fn drain(
        &self,
        st: &mut RxState,
        cap: u32,
        settings: &RxSettings,
        ready: &mut Vec<RxPacket>,
    ) -> (u32, bool) {
        let prod = st.front.rsp_prod();
        let mut cons = st.front.rsp_cons();
        let mut consumed = 0;
        let page_size = self.config.page_size;

        while cons != prod && consumed < cap {
            let slot = st.front.slot_id(cons);
            let taken = st.posted[slot as usize].take();
            let response_index = cons;
            cons = cons.wrapping_add(1);
            st.front.set_rsp_cons(cons);
            consumed += 1;

            let Some(id) = taken else {
                crate::error::defect(format_args!(
                    "{}: response {response_index} for unposted request {slot}",
                    RxError::BackendProtocolViolation
                ));
                RxStats::inc(&self.stats.violations);
                continue;
            };
            st.free_ids += 1;
            st.pool.arena.transition(id, Owner::Posted, Owner::InFlight);

            let completed = if st.reassembler.expects_extra() {
                let info = st.front.extra_info(response_index);
                st.pool.release(id, Owner::InFlight);
                st.reassembler.push_extra(&info)
            } else {
                let rsp = st.front.response(response_index);
                let offset = rsp.offset as usize;
                if rsp.status <= 0 || offset + rsp.status as usize > page_size || rsp.id != slot {
                    crate::error::defect(format_args!(
                        "{}: slot {slot} id {} offset {} status {}",
                        RxError::BackendProtocolViolation,
                        rsp.id,
                        rsp.offset,
                        rsp.status
                    ));
                    RxStats::inc(&self.stats.violations);
                    st.pool.release(id, Owner::InFlight);
                    st.reassembler.push_violation(&rsp)
                } else {
                    let desc = &mut st.pool.arena[id];
                    desc.offset = offset;
                    desc.len = rsp.status as usize;
                    st.reassembler.push_data(&mut st.pool, id, &rsp)
                }
            };
            if let Some(frame) = completed {
                self.complete_frame(st, frame, settings, ready);
                if st.split.is_some() {
                    return (consumed, true);
                }
            }
        }
        if st.reassembler.in_progress() {
            log::trace!("frame continues past this run");
        }
        (consumed, false)
    }

    fn drop_frame(st: &mut RxState, frame: Frame) {
        for id in frame.bufs {
            st.pool.release(id, Owner::InFlight);
        }
    }

    /// Turns a completed frame into packets.
    fn complete_frame(
        &self,
        st: &mut RxState,
        frame: Frame,
        settings: &RxSettings,
        ready: &mut Vec<RxPacket>,
    ) {
        if frame.errored {
            RxStats::inc(&self.stats.errored_frames);
            Self::drop_frame(st, frame);
            return;
        }
        if st.shutting_down {
            log::trace!("{}: frame dropped", RxError::ShuttingDown);
            Self::drop_frame(st, frame);
            return;
        }
        let Some(&first) = frame.bufs.first() else {
            return;
        };
        let (parsed, dest) = {
            let desc = &st.pool.arena[first];
            let page = desc.page.lock();
            let bytes = &page[desc.offset..desc.end()];
            (parse_header(bytes, frame.mss), header::destination(bytes))
        };
        if let Some(dest) = dest {
            if !settings.accepts(dest) {
                log::trace!("multicast frame filtered");
                RxStats::inc(&self.stats.filtered);
                Self::drop_frame(st, frame);
                return;
            }
        }

        let info = match parsed {
            Ok(info) if frame.len < ETH_HEADER_LEN + info.ip_total_len => {
                log::debug!(
                    "frame of {} bytes shorter than ip total length {}",
                    frame.len,
                    info.ip_total_len
                );
                RxStats::inc(&self.stats.too_small);
                None
            }
            Ok(info) => Some(info),
            Err(e) => {
                log::trace!("delivering unparsed frame: {e}");
                match e {
                    ParseError::TooSmall => RxStats::inc(&self.stats.too_small),
                    ParseError::UnknownProtocol => RxStats::inc(&self.stats.unknown_protocol),
                }
                None
            }
        };
        let Some(info) = info else {
            self.emit(st, &frame.bufs, ChecksumInfo::default(), settings, ready);
            return;
        };

        let split = info.split_required && Split::fits(&info, st.pool.page_size());
        if info.split_required && !split {
            log::debug!(
                "mss {} with {} header bytes exceeds the page, delivering whole",
                info.mss,
                info.headers_len()
            );
            RxStats::inc(&self.stats.unsplittable);
        }
        let blank_split = frame.csum_blank && split;
        let verdict = if blank_split {
            None
        } else {
            self.checksum_verdict(st, &frame, &info, settings)
        };
        if verdict == Some(false) {
            RxStats::inc(&self.stats.checksum_failures);
        }

        if split && verdict != Some(false) {
            let split = Split::new(&st.pool, frame, info);
            self.continue_split(st, split, settings, ready);
            return;
        }
        let annotation = annotate(&info, settings, verdict);
        self.emit(st, &frame.bufs, annotation, settings, ready);
    }

    fn checksum_verdict(
        &self,
        st: &RxState,
        frame: &Frame,
        info: &PacketInfo,
        settings: &RxSettings,
    ) -> Option<bool> {
        if frame.csum_blank {
            Some(transport_checksum(&st.pool.arena, &frame.bufs, info, ChecksumMode::Compute))
        } else if frame.data_validated && !settings.verify_checksums {
            Some(true)
        } else if settings.verify_checksums {
            Some(transport_checksum(&st.pool.arena, &frame.bufs, info, ChecksumMode::Verify))
        } else {
            None
        }
    }

    /// Wraps `bufs` into one packet and queues it for delivery.
    fn emit(
        &self,
        st: &mut RxState,
        bufs: &[BufId],
        checksum: ChecksumInfo,
        settings: &RxSettings,
        ready: &mut Vec<RxPacket>,
    ) {
        let mut packet = st.packets.acquire();
        for &id in bufs {
            st.packets.attach(&mut packet, &st.pool.arena, id);
        }
        packet.set_checksum(checksum);
        if packet.len() > settings.mtu as usize + ETH_HEADER_LEN {
            log::warn!("received {} byte packet, mtu is {}", packet.len(), settings.mtu);
            RxStats::inc(&self.stats.oversized);
        }
        ready.push(packet);
    }

    /// Emits segments until the split is done or stalls. Returns `true` when done.
    fn continue_split(
        &self,
        st: &mut RxState,
        mut split: Split,
        settings: &RxSettings,
        ready: &mut Vec<RxPacket>,
    ) -> bool {
        let annotation = ChecksumInfo {
            tcp_succeeded: settings.offload.tcp,
            ..Default::default()
        };
        loop {
            match split.next_segment(&mut st.pool) {
                Ok(Some(id)) => {
                    RxStats::inc(&self.stats.segments);
                    self.emit(st, &[id], annotation, settings, ready);
                }
                Ok(None) => return true,
                Err(Stalled) => {
                    log::debug!(
                        "{}: split stalled with {} bytes left",
                        RxError::ResourceExhaustion,
                        split.remaining()
                    );
                    RxStats::inc(&self.stats.split_stalls);
                    RxStats::inc(&self.stats.exhaustion);
                    st.split = Some(split);
                    return false;
                }
            }
        }
    }

    /// Gives a delivered packet back. Must not be called with the rx lock held.
    pub fn return_packet(&self, packet: RxPacket) {
        let mut guard = self.lock();
        let st = &mut *guard;
        let remaining = st.packets.recycle(&mut st.pool, packet);
        if remaining == 0 && st.shutting_down && !st.shutdown_signalled {
            st.shutdown_signalled = true;
            RxStats::inc(&self.stats.shutdown_wakes);
            self.drained.notify_all();
            #[cfg(feature = "async_tokio")]
            self.drained_async.notify_one();
        }
    }

    /// Gives back free pages the freelist has not needed since the last call.
    pub fn trim_freelist(&self) -> usize {
        let freed = self.lock().pool.trim();
        RxStats::add(&self.stats.pages_trimmed, freed as u64);
        freed
    }

    /// The backend is going away: take every posted page back and reset the ring.
    pub fn suspend(&self) {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.suspended = true;
        Self::unpost_all(st);
        let partial = st.reassembler.take();
        Self::drop_frame(st, partial);
        st.front.reset();
        log::debug!("rx path suspended");
    }

    /// The backend is back: re-grant free pages and post from scratch.
    pub fn resume(&self) {
        let notify = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if !st.suspended {
                return;
            }
            st.suspended = false;
            st.pool.resume();
            self.replenish(st)
        };
        if notify {
            self.events.notify();
        }
        log::debug!("rx path resumed");
    }

    fn unpost_all(st: &mut RxState) {
        for slot in st.posted.iter_mut() {
            if let Some(id) = slot.take() {
                st.pool.release(id, Owner::Posted);
            }
        }
        st.free_ids = st.posted.len() as u32;
    }

    /// Stops building packets and drops any unfinished work.
    fn begin_shutdown(st: &mut RxState) {
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        if let Some(split) = st.split.take() {
            Self::drop_frame(st, split.frame);
        }
        let partial = st.reassembler.take();
        Self::drop_frame(st, partial);
        log::debug!(
            "rx shutdown, waiting for {} packets",
            st.packets.outstanding()
        );
    }

    fn finish_shutdown(st: &mut RxState) {
        if st.disposed {
            return;
        }
        st.disposed = true;
        Self::unpost_all(st);
        st.pool.dispose();
    }

    /// Stops the receive path and blocks until the host returned every packet.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        Self::begin_shutdown(&mut guard);
        while guard.packets.outstanding() > 0 {
            guard = self
                .drained
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::finish_shutdown(&mut guard);
    }

    /// Like [`RxContext::shutdown`], but waits without blocking the thread.
    #[cfg(feature = "async_tokio")]
    pub async fn shutdown_async(&self) {
        loop {
            let notified = self.drained_async.notified();
            {
                let mut guard = self.lock();
                Self::begin_shutdown(&mut guard);
                if guard.packets.outstanding() == 0 {
                    Self::finish_shutdown(&mut guard);
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Packets handed to the host and not yet returned.
    pub fn outstanding_packets(&self) -> usize {
        self.lock().packets.outstanding()
    }

    pub fn buffer_census(&self) -> BufferCensus {
        self.lock().pool.census()
    }

    /// Cross-checks every owner tag against the structure that claims the buffer.
    ///
    /// Each posted slot, the freelist, the partial frame, a stalled split and
    /// delivered packets must account for exactly the buffers tagged for them.
    pub fn check_ownership(&self) -> Result<(), String> {
        let guard = self.lock();
        let st = &*guard;
        let mut seen = HashSet::new();
        let mut posted = 0;
        for id in st.posted.iter().flatten() {
            if !seen.insert(*id) {
                return Err(format!("{id:?} posted twice"));
            }
            if st.pool.arena.owner(*id) != Some(Owner::Posted) {
                return Err(format!("{id:?} posted but tagged {:?}", st.pool.arena.owner(*id)));
            }
            posted += 1;
        }
        let census = st.pool.census();
        if census.posted != posted {
            return Err(format!("{} tagged posted, {posted} on the ring", census.posted));
        }
        if posted as u32 != st.front.outstanding() || posted as u32 + st.free_ids != st.posted.len() as u32 {
            return Err(format!(
                "{posted} posted, ring has {} outstanding, {} free ids",
                st.front.outstanding(),
                st.free_ids
            ));
        }
        st.pool.check_freelist()?;

        let split = st.split.iter().flat_map(|s| s.frame.bufs.iter());
        let mut in_flight = 0;
        for id in st.reassembler.buffers().iter().chain(split) {
            if !seen.insert(*id) {
                return Err(format!("{id:?} held twice"));
            }
            if st.pool.arena.owner(*id) != Some(Owner::InFlight) {
                return Err(format!("{id:?} in a frame but tagged {:?}", st.pool.arena.owner(*id)));
            }
            in_flight += 1;
        }
        in_flight += st.packets.held_buffers();
        if census.in_flight != in_flight {
            return Err(format!(
                "{} tagged in flight, {in_flight} accounted for",
                census.in_flight
            ));
        }
        Ok(())
    }
}

fn annotate(info: &PacketInfo, settings: &RxSettings, verdict: Option<bool>) -> ChecksumInfo {
    let mut annotation = ChecksumInfo::default();
    let Some(ok) = verdict else {
        return annotation;
    };
    if info.is_tcp() && settings.offload.tcp {
        annotation.tcp_succeeded = ok;
        annotation.tcp_failed = !ok;
    } else if info.is_udp() && settings.offload.udp {
        annotation.udp_succeeded = ok;
        annotation.udp_failed = !ok;
    }
    annotation
}
