#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
# netfront-rs: Paravirtual NIC Receive Path

The guest side of a split network driver receives packets from a
hypervisor-side virtual switch (the backend) over a ring of 8-byte slots in
shared memory. This crate implements that receive path:

- posting empty, granted pages to the ring and consuming the responses,
- folding multi-response frames into as few pages as possible,
- parsing Ethernet/IPv4/TCP/UDP headers and computing or verifying
  transport checksums across page boundaries,
- splitting oversized TCP frames the backend coalesced (GSO) back into
  MSS-sized packets,
- moderating interrupts with an adaptive notification threshold and a
  deadline timer,
- keeping every page owned by exactly one party: the freelist, the ring, or
  a packet in flight.

The hypervisor facilities are abstracted behind traits:

- [`GrantTable`] grants and revokes backend access to a page,
- [`EventChannel`] notifies the backend,
- [`HostStack`] receives packets and hands them back through
  [`RxContext::return_packet`].

## Usage

```no_run
use std::sync::Arc;

use netfront_rs::{
    EventChannel, GrantRef, GrantTable, HostStack, Page, RxConfigBuilder, RxContext, RxPacket,
    RxSettings, SharedRing,
};

struct Grants;
impl GrantTable for Grants {
    fn grant_access(&self, _page: &Page, _readonly: bool) -> Option<GrantRef> {
        Some(GrantRef(1))
    }
    fn end_access(&self, _gref: GrantRef) {}
}

struct Channel;
impl EventChannel for Channel {
    fn notify(&self) {}
}

struct Stack;
impl HostStack for Stack {
    fn indicate_receive(&self, packets: Vec<RxPacket>) {
        for packet in packets {
            println!("{} bytes", packet.len());
        }
    }
}

let config = RxConfigBuilder::new().ring_depth(256).build()?;
let shared = Arc::new(SharedRing::new(256)?);
let ctx = RxContext::new(
    config,
    RxSettings::default(),
    shared,
    Arc::new(Grants),
    Arc::new(Channel),
    Arc::new(Stack),
)?;

// event channel handler
if ctx.interrupt() {
    let outcome = ctx.run();
    println!("{outcome:?}");
}
# Ok::<(), std::io::Error>(())
```

With the `async` feature, [`RxDriver`] runs the context on a tokio task.

## Features

- `async` / `async_tokio`: the tokio driver and [`RxContext::shutdown_async`].
- `strict`: backend protocol violations and bookkeeping defects panic
  instead of being logged and recovered from.
*/

mod buffer;
pub mod checksum;
mod config;
mod cursor;
mod error;
mod freelist;
pub mod header;
pub mod moderation;
mod packet;
mod reassembly;
pub mod ring;
mod rx;
mod segment;
mod stats;

#[cfg_attr(docsrs, doc(cfg(feature = "async_tokio")))]
#[cfg(feature = "async_tokio")]
mod async_driver;

#[cfg_attr(docsrs, doc(cfg(feature = "async_tokio")))]
#[cfg(feature = "async_tokio")]
pub use crate::async_driver::RxDriver;
pub use crate::buffer::{BufferCensus, GrantRef, GrantTable, Owner, Page};
pub use crate::config::*;
pub use crate::error::RxError;
pub use crate::header::{PacketInfo, ParseError};
pub use crate::moderation::{SchedState, WakeSource};
pub use crate::packet::{ChecksumInfo, RxPacket};
pub use crate::ring::{BackRing, ExtraInfo, RxRequest, RxResponse, SharedRing};
pub use crate::rx::{EventChannel, HostStack, RunOutcome, RxContext};
pub use crate::stats::{RxStats, RxStatsSnapshot};
