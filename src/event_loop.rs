//! Shared readiness event loop.
//!
//! The loop provides exactly three services to its drivers: readiness
//! notification on non-blocking sockets, one-shot timers, and a thread-safe
//! "post work to the loop thread" primitive. All driver state is mutated on
//! the loop thread only; producers on other threads interact with the loop
//! exclusively through [`LoopHandle::post`].
//!
//! # Architecture
//!
//! ```text
//! producer threads                      loop thread
//! ───────────────                       ───────────
//! LoopHandle::post(job) ──► SegQueue ──► run(): drain jobs
//!                           Poller      fire due timers
//!                           notify ───► wait for readiness
//!                                       route events to drivers
//! ```
//!
//! Readiness registrations are one-shot: after an event is delivered the
//! source is disarmed until the driver re-arms it with
//! [`LoopCtx::set_interest`].

use crossbeam_queue::SegQueue;
use polling::{Event, Poller};
use slab::Slab;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::timer::{TimerBinding, TimerQueue, TimerToken};

/// Identifies a driver installed in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverId(usize);

/// Token for a registered I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceToken(usize);

/// A component driven by the loop: readiness events, timer expiries, and
/// wake requests are delivered through this trait on the loop thread.
pub trait Driver: Send {
    /// Called once, when the driver is installed.
    fn on_start(&mut self, ctx: &mut LoopCtx<'_>) {
        let _ = ctx;
    }

    /// Called for every posted wake request addressed to this driver.
    fn on_wake(&mut self, ctx: &mut LoopCtx<'_>);

    /// Called when a registered source becomes ready. `tag` is the value
    /// given at registration.
    fn on_io(&mut self, ctx: &mut LoopCtx<'_>, tag: u64, readable: bool, writable: bool);

    /// Called when a timer armed by this driver fires.
    fn on_timer(&mut self, ctx: &mut LoopCtx<'_>, tag: u64);

    /// True when the driver has no outstanding work; a retiring driver is
    /// removed from the loop at the first idle moment.
    fn is_idle(&self) -> bool;

    /// Called just before a retiring driver is removed.
    fn on_shutdown(&mut self, ctx: &mut LoopCtx<'_>) {
        let _ = ctx;
    }
}

/// Work item executed on the loop thread.
type Job = Box<dyn FnOnce(&mut LoopCore) + Send>;

struct LoopShared {
    jobs: SegQueue<Job>,
    poller: Poller,
}

/// Cloneable, thread-safe handle to a running (or not yet running) loop.
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl Clone for LoopHandle {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl LoopHandle {
    /// Posts a job to run on the loop thread, waking the loop if it is
    /// blocked in `wait`. Jobs run in post order.
    pub fn post(&self, job: impl FnOnce(&mut LoopCore) + Send + 'static) {
        self.shared.jobs.push(Box::new(job));
        let _ = self.shared.poller.notify();
    }

    /// Requests that [`EventLoop::run`] return after the current batch.
    pub fn stop(&self) {
        self.post(LoopCore::stop);
    }
}

struct DriverSlot {
    driver: Option<Box<dyn Driver>>,
    retiring: bool,
}

#[derive(Debug, Clone, Copy)]
struct SourceBinding {
    driver: usize,
    tag: u64,
}

/// Loop state reachable from posted jobs and driver callbacks.
pub struct LoopCore {
    shared: Arc<LoopShared>,
    drivers: Slab<DriverSlot>,
    sources: Slab<SourceBinding>,
    timers: TimerQueue,
    stop: bool,
}

impl LoopCore {
    /// Installs a driver and delivers its `on_start`.
    pub fn install(&mut self, driver: Box<dyn Driver>) -> DriverId {
        let id = self.drivers.insert(DriverSlot {
            driver: Some(driver),
            retiring: false,
        });
        self.with_driver(id, |driver, ctx| driver.on_start(ctx));
        DriverId(id)
    }

    /// Delivers a wake to the driver, if it is still installed.
    pub fn wake(&mut self, id: DriverId) {
        self.with_driver(id.0, |driver, ctx| driver.on_wake(ctx));
        self.reap(id.0);
    }

    /// Marks a driver for removal at its first idle moment.
    pub fn retire(&mut self, id: DriverId) {
        if let Some(slot) = self.drivers.get_mut(id.0) {
            slot.retiring = true;
        }
        self.reap(id.0);
    }

    /// Requests that the running loop return.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Runs `f` with the driver taken out of its slot, so the driver can
    /// freely use a context borrowing the rest of the loop.
    fn with_driver(
        &mut self,
        id: usize,
        f: impl FnOnce(&mut Box<dyn Driver>, &mut LoopCtx<'_>),
    ) {
        let Some(slot) = self.drivers.get_mut(id) else {
            return;
        };
        let Some(mut driver) = slot.driver.take() else {
            return;
        };
        let mut ctx = LoopCtx {
            poller: &self.shared.poller,
            sources: &mut self.sources,
            timers: &mut self.timers,
            driver: id,
        };
        f(&mut driver, &mut ctx);
        if let Some(slot) = self.drivers.get_mut(id) {
            slot.driver = Some(driver);
        }
    }

    /// Removes a retiring driver once it reports idle.
    fn reap(&mut self, id: usize) {
        let ready = self.drivers.get(id).is_some_and(|slot| {
            slot.retiring && slot.driver.as_ref().is_some_and(|d| d.is_idle())
        });
        if !ready {
            return;
        }
        self.with_driver(id, |driver, ctx| driver.on_shutdown(ctx));
        self.drivers.try_remove(id);
        self.timers.cancel_driver(id);
    }

    fn dispatch_io(&mut self, event: Event) {
        let Some(binding) = self.sources.get(event.key).copied() else {
            return;
        };
        self.with_driver(binding.driver, |driver, ctx| {
            driver.on_io(ctx, binding.tag, event.readable, event.writable);
        });
        self.reap(binding.driver);
    }

    fn dispatch_timer(&mut self, binding: TimerBinding) {
        self.with_driver(binding.driver, |driver, ctx| {
            driver.on_timer(ctx, binding.tag);
        });
        self.reap(binding.driver);
    }
}

/// Loop services available to a driver during a callback.
pub struct LoopCtx<'a> {
    poller: &'a Poller,
    sources: &'a mut Slab<SourceBinding>,
    timers: &'a mut TimerQueue,
    driver: usize,
}

impl LoopCtx<'_> {
    /// Registers a non-blocking socket for readiness notification.
    ///
    /// # Errors
    ///
    /// Propagates the poller's registration error; the source is not
    /// tracked on failure.
    pub fn register(
        &mut self,
        socket: &TcpStream,
        tag: u64,
        readable: bool,
        writable: bool,
    ) -> io::Result<SourceToken> {
        let key = self.sources.insert(SourceBinding {
            driver: self.driver,
            tag,
        });
        if let Err(e) = self.poller.add(socket, interest_event(key, readable, writable)) {
            self.sources.try_remove(key);
            return Err(e);
        }
        Ok(SourceToken(key))
    }

    /// Re-arms a registered socket with the given interest.
    pub fn set_interest(
        &self,
        socket: &TcpStream,
        token: SourceToken,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        self.poller
            .modify(socket, interest_event(token.0, readable, writable))
    }

    /// Removes a socket from the poller and forgets its token.
    pub fn deregister(&mut self, socket: &TcpStream, token: SourceToken) -> io::Result<()> {
        self.sources.try_remove(token.0);
        self.poller.delete(socket)
    }

    /// Arms a one-shot timer firing `after` from now.
    pub fn arm_timer(&mut self, after: Duration, tag: u64) -> TimerToken {
        self.timers.arm(after, self.driver, tag)
    }

    /// Cancels an armed timer; a cancelled timer never fires.
    pub fn cancel_timer(&mut self, token: TimerToken) {
        self.timers.cancel(token);
    }
}

/// Translates interest flags to the poller's event type.
fn interest_event(key: usize, readable: bool, writable: bool) -> Event {
    match (readable, writable) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

/// The event loop itself. Create once, hand out [`LoopHandle`]s, then
/// [`run`](Self::run) on the thread that should own all driver state.
pub struct EventLoop {
    core: LoopCore,
    events: Vec<Event>,
}

impl EventLoop {
    /// Creates a loop and its poller.
    ///
    /// # Errors
    ///
    /// Returns an error when the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(LoopShared {
            jobs: SegQueue::new(),
            poller: Poller::new()?,
        });
        Ok(Self {
            core: LoopCore {
                shared,
                drivers: Slab::new(),
                sources: Slab::new(),
                timers: TimerQueue::new(),
                stop: false,
            },
            events: Vec::new(),
        })
    }

    /// Returns a cloneable handle for posting work and stopping the loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.core.shared),
        }
    }

    /// Runs the loop until a stop request is processed.
    ///
    /// May be called again after returning; pending drivers, sources, and
    /// timers are retained across calls.
    ///
    /// # Errors
    ///
    /// Returns an error when waiting on the poller fails for a reason other
    /// than an interrupted system call.
    pub fn run(&mut self) -> io::Result<()> {
        let shared = Arc::clone(&self.core.shared);
        self.core.stop = false;
        loop {
            while let Some(job) = shared.jobs.pop() {
                job(&mut self.core);
            }
            if self.core.stop {
                self.core.stop = false;
                return Ok(());
            }

            let now = Instant::now();
            loop {
                let Some(binding) = self.core.timers.pop_expired(now) else {
                    break;
                };
                self.core.dispatch_timer(binding);
            }

            let timeout = self
                .core
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            self.events.clear();
            match shared.poller.wait(&mut self.events, timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for i in 0..self.events.len() {
                let event = self.events[i];
                self.core.dispatch_io(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDriver {
        wakes: Arc<AtomicUsize>,
    }

    impl Driver for CountingDriver {
        fn on_wake(&mut self, _ctx: &mut LoopCtx<'_>) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_io(&mut self, _ctx: &mut LoopCtx<'_>, _tag: u64, _r: bool, _w: bool) {}

        fn on_timer(&mut self, _ctx: &mut LoopCtx<'_>, _tag: u64) {}

        fn is_idle(&self) -> bool {
            true
        }
    }

    #[test]
    fn posted_jobs_run_in_order_and_stop_returns() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let seen = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            handle.post(move |_core| {
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), i);
            });
        }
        handle.stop();
        el.run().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wake_reaches_installed_driver() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let wakes = Arc::new(AtomicUsize::new(0));

        let driver = CountingDriver {
            wakes: Arc::clone(&wakes),
        };
        handle.post(move |core| {
            let id = core.install(Box::new(driver));
            core.wake(id);
        });
        handle.stop();
        el.run().unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timers_fire_and_run_returns_on_stop_from_job() {
        struct ArmingDriver {
            timers: Arc<AtomicUsize>,
        }
        impl Driver for ArmingDriver {
            fn on_start(&mut self, ctx: &mut LoopCtx<'_>) {
                ctx.arm_timer(Duration::from_millis(5), 1);
                ctx.arm_timer(Duration::from_millis(10), 2);
            }
            fn on_wake(&mut self, _ctx: &mut LoopCtx<'_>) {}
            fn on_io(&mut self, _ctx: &mut LoopCtx<'_>, _tag: u64, _r: bool, _w: bool) {}
            fn on_timer(&mut self, _ctx: &mut LoopCtx<'_>, _tag: u64) {
                self.timers.fetch_add(1, Ordering::SeqCst);
            }
            fn is_idle(&self) -> bool {
                true
            }
        }

        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let timers = Arc::new(AtomicUsize::new(0));
        let driver = ArmingDriver {
            timers: Arc::clone(&timers),
        };
        handle.post(move |core| {
            core.install(Box::new(driver));
        });

        let stopper = el.handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        el.run().unwrap();
        assert_eq!(timers.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retired_idle_driver_is_removed() {
        let mut el = EventLoop::new().unwrap();
        let handle = el.handle();
        let wakes = Arc::new(AtomicUsize::new(0));

        let driver = CountingDriver {
            wakes: Arc::clone(&wakes),
        };
        handle.post(move |core| {
            let id = core.install(Box::new(driver));
            core.retire(id);
            // A wake after removal must be ignored, not panic.
            core.wake(id);
        });
        handle.stop();
        el.run().unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 0);
    }
}
