/*!
# Receive Path Configuration

Two kinds of knobs exist:

- [`RxConfig`], built once with [`RxConfigBuilder`], fixes the shape of the
  receive path: ring depth, page size, pool sizes and the moderation timers.
- [`RxSettings`] can be swapped at any time through
  [`crate::RxContext::update_settings`]: MTU, checksum offload, the packet
  filter and the multicast list. A run reads one snapshot of the settings
  when it starts and uses it throughout.

```
use netfront_rs::RxConfigBuilder;
use std::time::Duration;

let config = RxConfigBuilder::new()
    .ring_depth(256)
    .response_budget(64)
    .deadline(Duration::from_millis(10))
    .interrupt_moderation(true)
    .build()?;
assert_eq!(config.ring_depth(), 256);
# Ok::<(), std::io::Error>(())
```
*/

use std::io;
use std::time::Duration;

use mac_address::MacAddress;

use crate::error::RxError;
use crate::header::MAX_HEADERS_LEN;

pub const DEFAULT_RING_DEPTH: usize = 256;
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_FREELIST_TARGET: usize = 16;
pub const DEFAULT_TRIM_CAP: usize = 16;
pub const DEFAULT_RESPONSE_BUDGET: u32 = 64;
pub const DEFAULT_INDICATE_BATCH: usize = 32;
pub const DEFAULT_EVENT_CAP: u32 = 128;
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(10);
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound of the multicast list.
pub const MAX_MULTICAST: usize = 32;

/// Static parameters of a receive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxConfig {
    pub(crate) ring_depth: usize,
    pub(crate) page_size: usize,
    pub(crate) target_posted: u32,
    pub(crate) freelist_target: usize,
    pub(crate) trim_cap: usize,
    pub(crate) packet_pool_capacity: usize,
    pub(crate) response_budget: u32,
    pub(crate) indicate_batch: usize,
    pub(crate) event_cap: u32,
    pub(crate) deadline: Duration,
    pub(crate) trim_interval: Duration,
    pub(crate) interrupt_moderation: bool,
}

impl RxConfig {
    pub fn ring_depth(&self) -> usize {
        self.ring_depth
    }
    pub fn page_size(&self) -> usize {
        self.page_size
    }
    /// Requests kept posted on the ring.
    pub fn target_posted(&self) -> u32 {
        self.target_posted
    }
    pub fn freelist_target(&self) -> usize {
        self.freelist_target
    }
    pub fn trim_cap(&self) -> usize {
        self.trim_cap
    }
    pub fn packet_pool_capacity(&self) -> usize {
        self.packet_pool_capacity
    }
    pub fn response_budget(&self) -> u32 {
        self.response_budget
    }
    pub fn indicate_batch(&self) -> usize {
        self.indicate_batch
    }
    pub fn event_cap(&self) -> u32 {
        self.event_cap
    }
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
    pub fn trim_interval(&self) -> Duration {
        self.trim_interval
    }
    pub fn interrupt_moderation(&self) -> bool {
        self.interrupt_moderation
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        RxConfig {
            ring_depth: DEFAULT_RING_DEPTH,
            page_size: DEFAULT_PAGE_SIZE,
            target_posted: DEFAULT_RING_DEPTH as u32,
            freelist_target: DEFAULT_FREELIST_TARGET,
            trim_cap: DEFAULT_TRIM_CAP,
            packet_pool_capacity: 2 * DEFAULT_RING_DEPTH,
            response_budget: DEFAULT_RESPONSE_BUDGET,
            indicate_batch: DEFAULT_INDICATE_BATCH,
            event_cap: DEFAULT_EVENT_CAP,
            deadline: DEFAULT_DEADLINE,
            trim_interval: DEFAULT_TRIM_INTERVAL,
            interrupt_moderation: true,
        }
    }
}

/// Builder for [`RxConfig`]. Unset values take their defaults; values that
/// scale with the ring (posted target, packet pool) follow the chosen depth.
#[derive(Clone, Default, Debug)]
pub struct RxConfigBuilder {
    ring_depth: Option<usize>,
    page_size: Option<usize>,
    target_posted: Option<u32>,
    freelist_target: Option<usize>,
    trim_cap: Option<usize>,
    packet_pool_capacity: Option<usize>,
    response_budget: Option<u32>,
    indicate_batch: Option<usize>,
    event_cap: Option<u32>,
    deadline: Option<Duration>,
    trim_interval: Option<Duration>,
    interrupt_moderation: Option<bool>,
}

impl RxConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Number of ring slots; a power of two no larger than 65536.
    pub fn ring_depth(mut self, depth: usize) -> Self {
        self.ring_depth = Some(depth);
        self
    }
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
    pub fn target_posted(mut self, target: u32) -> Self {
        self.target_posted = Some(target);
        self
    }
    /// Free pages kept around across trim periods.
    pub fn freelist_target(mut self, target: usize) -> Self {
        self.freelist_target = Some(target);
        self
    }
    /// Most pages given back per trim period.
    pub fn trim_cap(mut self, cap: usize) -> Self {
        self.trim_cap = Some(cap);
        self
    }
    pub fn packet_pool_capacity(mut self, capacity: usize) -> Self {
        self.packet_pool_capacity = Some(capacity);
        self
    }
    /// Most responses consumed per run before the run reschedules itself.
    pub fn response_budget(mut self, budget: u32) -> Self {
        self.response_budget = Some(budget);
        self
    }
    /// Most packets per call into the host stack.
    pub fn indicate_batch(mut self, batch: usize) -> Self {
        self.indicate_batch = Some(batch);
        self
    }
    /// Upper bound of the moderated notification threshold.
    pub fn event_cap(mut self, cap: u32) -> Self {
        self.event_cap = Some(cap);
        self
    }
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
    pub fn trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = Some(interval);
        self
    }
    pub fn interrupt_moderation(mut self, enable: bool) -> Self {
        self.interrupt_moderation = Some(enable);
        self
    }

    pub fn build(self) -> io::Result<RxConfig> {
        let defaults = RxConfig::default();
        let ring_depth = self.ring_depth.unwrap_or(defaults.ring_depth);
        if ring_depth == 0 || !ring_depth.is_power_of_two() || ring_depth > u16::MAX as usize + 1 {
            return Err(RxError::InvalidConfig("ring depth must be a power of two <= 65536").into());
        }
        let page_size = self.page_size.unwrap_or(defaults.page_size);
        if !(MAX_HEADERS_LEN + 1..=i16::MAX as usize + 1).contains(&page_size) {
            return Err(RxError::InvalidConfig("page size must be within 135..=32768").into());
        }
        let target_posted = self.target_posted.unwrap_or(ring_depth as u32);
        if target_posted == 0 || target_posted as usize > ring_depth {
            return Err(RxError::InvalidConfig("posted target must be within 1..=ring depth").into());
        }
        let response_budget = self.response_budget.unwrap_or(defaults.response_budget);
        if response_budget == 0 {
            return Err(RxError::InvalidConfig("response budget must be positive").into());
        }
        let indicate_batch = self.indicate_batch.unwrap_or(defaults.indicate_batch);
        if indicate_batch == 0 {
            return Err(RxError::InvalidConfig("indicate batch must be positive").into());
        }
        let event_cap = self
            .event_cap
            .unwrap_or(defaults.event_cap)
            .min(ring_depth as u32);
        if event_cap == 0 {
            return Err(RxError::InvalidConfig("event cap must be positive").into());
        }
        let trim_interval = self.trim_interval.unwrap_or(defaults.trim_interval);
        if trim_interval.is_zero() {
            return Err(RxError::InvalidConfig("trim interval must be positive").into());
        }
        Ok(RxConfig {
            ring_depth,
            page_size,
            target_posted,
            freelist_target: self.freelist_target.unwrap_or(defaults.freelist_target),
            trim_cap: self.trim_cap.unwrap_or(defaults.trim_cap),
            packet_pool_capacity: self.packet_pool_capacity.unwrap_or(2 * ring_depth),
            response_budget,
            indicate_batch,
            event_cap,
            deadline: self.deadline.unwrap_or(defaults.deadline),
            trim_interval,
            interrupt_moderation: self
                .interrupt_moderation
                .unwrap_or(defaults.interrupt_moderation),
        })
    }
}

/// Receive checksum offload per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumOffload {
    pub tcp: bool,
    pub udp: bool,
}

impl Default for ChecksumOffload {
    fn default() -> Self {
        ChecksumOffload {
            tcp: true,
            udp: true,
        }
    }
}

/// Which destination classes the host asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFilter {
    pub directed: bool,
    pub multicast: bool,
    pub all_multicast: bool,
    pub broadcast: bool,
    pub promiscuous: bool,
}

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter {
            directed: true,
            multicast: true,
            all_multicast: false,
            broadcast: true,
            promiscuous: false,
        }
    }
}

/// Live settings, replaced as a whole by [`crate::RxContext::update_settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxSettings {
    pub mtu: u16,
    pub offload: ChecksumOffload,
    /// Verify checksums the backend claims valid instead of trusting the claim.
    pub verify_checksums: bool,
    pub filter: PacketFilter,
    multicast: Vec<MacAddress>,
}

impl Default for RxSettings {
    fn default() -> Self {
        RxSettings {
            mtu: 1500,
            offload: ChecksumOffload::default(),
            verify_checksums: false,
            filter: PacketFilter::default(),
            multicast: Vec::new(),
        }
    }
}

impl RxSettings {
    pub fn multicast_list(&self) -> &[MacAddress] {
        &self.multicast
    }

    /// Replaces the multicast list.
    ///
    /// # Errors
    ///
    /// More than [`MAX_MULTICAST`] addresses.
    pub fn set_multicast_list<I>(&mut self, list: I) -> io::Result<()>
    where
        I: IntoIterator<Item = MacAddress>,
    {
        let list: Vec<MacAddress> = list.into_iter().collect();
        if list.len() > MAX_MULTICAST {
            return Err(RxError::InvalidConfig("too many multicast addresses").into());
        }
        self.multicast = list;
        Ok(())
    }

    /// Whether a frame for `dest` passes the multicast gate.
    pub(crate) fn accepts(&self, dest: [u8; 6]) -> bool {
        let is_multicast = dest[0] & 1 != 0;
        let is_broadcast = dest == [0xff; 6];
        if self.filter.promiscuous || !is_multicast || is_broadcast {
            return true;
        }
        if !self.filter.multicast || self.filter.all_multicast {
            return true;
        }
        self.multicast.iter().any(|m| m.bytes() == dest)
    }
}
