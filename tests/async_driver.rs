#![cfg(feature = "async_tokio")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netfront_rs::{
    BackRing, EventChannel, GrantRef, GrantTable, HostStack, Page, RxConfigBuilder, RxContext,
    RxDriver, RxPacket, RxResponse, RxSettings, SharedRing,
};

#[derive(Default)]
struct Grants {
    next: AtomicU32,
    pages: Mutex<HashMap<GrantRef, Page>>,
}

impl GrantTable for Grants {
    fn grant_access(&self, page: &Page, _readonly: bool) -> Option<GrantRef> {
        let gref = GrantRef(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.pages.lock().unwrap().insert(gref, page.clone());
        Some(gref)
    }

    fn end_access(&self, gref: GrantRef) {
        self.pages.lock().unwrap().remove(&gref);
    }
}

struct Quiet;

impl EventChannel for Quiet {
    fn notify(&self) {}
}

#[derive(Default)]
struct Collector {
    held: Mutex<Vec<RxPacket>>,
}

impl HostStack for Collector {
    fn indicate_receive(&self, packets: Vec<RxPacket>) {
        self.held.lock().unwrap().extend(packets);
    }
}

impl Collector {
    fn count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    fn take(&self) -> Vec<RxPacket> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }
}

struct Backend {
    ring: BackRing,
    grants: Arc<Grants>,
}

impl Backend {
    /// Fills the next posted page with a raw frame of `len` bytes.
    fn send(&mut self, len: usize) {
        let (_, req) = self.ring.next_request().expect("no posted request");
        let page = self.grants.pages.lock().unwrap()[&req.gref].clone();
        page.lock()[..len].fill(0x10);
        self.ring.put_response(RxResponse {
            id: req.id,
            offset: 0,
            flags: 0,
            status: len as i16,
        });
    }
}

fn setup(builder: RxConfigBuilder) -> (Arc<RxContext>, Backend, Arc<Collector>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = builder.build().unwrap();
    let shared = Arc::new(SharedRing::new(config.ring_depth()).unwrap());
    let grants = Arc::new(Grants::default());
    let backend = Backend {
        ring: BackRing::new(shared.clone()),
        grants: grants.clone(),
    };
    let host = Arc::new(Collector::default());
    let ctx = RxContext::new(
        config,
        RxSettings::default(),
        shared,
        grants,
        Arc::new(Quiet),
        host.clone(),
    )
    .unwrap();
    (Arc::new(ctx), backend, host)
}

async fn wait_for(host: &Collector, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while host.count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("packets did not arrive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_drives_runs() {
    let (ctx, mut backend, host) = setup(RxConfigBuilder::new().ring_depth(32).response_budget(4));
    let driver = RxDriver::spawn(ctx.clone());

    for _ in 0..10 {
        backend.send(64);
    }
    backend.ring.push_responses();
    driver.interrupt();
    // budget of 4 per run, the rest through reschedules
    wait_for(&host, 10).await;

    for packet in host.take() {
        ctx.return_packet(packet);
    }
    driver.stop().await.unwrap();
    assert!(ctx.is_shutting_down());
    assert_eq!(ctx.buffer_census().total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_picks_up_quiet_responses() {
    let (ctx, mut backend, host) = setup(
        RxConfigBuilder::new()
            .ring_depth(64)
            .deadline(Duration::from_millis(50)),
    );
    let driver = RxDriver::spawn(ctx.clone());

    for _ in 0..40 {
        backend.send(60);
    }
    backend.ring.push_responses();
    driver.interrupt();
    wait_for(&host, 40).await;

    // below the notification threshold the backend stays quiet and the
    // deadline has to fire
    backend.send(60);
    if backend.ring.push_responses() {
        // the deadline already fired and reset the threshold
        driver.interrupt();
    }
    wait_for(&host, 41).await;

    for packet in host.take() {
        ctx.return_packet(packet);
    }
    driver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_outstanding_packets() {
    let (ctx, mut backend, host) = setup(RxConfigBuilder::new().ring_depth(8));
    let driver = RxDriver::spawn(ctx.clone());

    backend.send(100);
    backend.ring.push_responses();
    driver.interrupt();
    wait_for(&host, 1).await;

    let returner = {
        let ctx = ctx.clone();
        let host = host.clone();
        tokio::spawn(async move {
            while !ctx.is_shutting_down() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            for packet in host.take() {
                ctx.return_packet(packet);
            }
        })
    };
    driver.stop().await.unwrap();
    returner.await.unwrap();

    assert_eq!(ctx.outstanding_packets(), 0);
    assert_eq!(ctx.stats().shutdown_wakes, 1);
    assert_eq!(ctx.buffer_census().total(), 0);
}
