//! Request scheduler: matches queued requests to available connections.
//!
//! The dispatcher is installed into the event loop as a [`Driver`] and owns
//! the fixed-size connection pool. All of its state is confined to the loop
//! thread; producers reach it only through the shared pending queue plus a
//! posted wake.

use std::sync::Arc;

use crate::client::{ClientShared, Origin};
use crate::conn::Connection;
use crate::event_loop::{Driver, LoopCtx};

/// Scheduler over a fixed pool of [`Connection`]s.
///
/// Assignment policy: the oldest queued request goes to any available
/// connection, popped in O(1) from a free list. FIFO over requests is the
/// only ordering guarantee; there is no fairness or load-balancing
/// criterion across connections.
pub(crate) struct Dispatcher {
    shared: Arc<ClientShared>,
    conns: Vec<Connection>,
    /// Free list of pool indices with no request in flight; push/pop at the
    /// end makes assignment O(1).
    available: Vec<usize>,
    /// Membership flags for `available`, so a connection event cannot push
    /// an index that is already on the free list.
    on_free_list: Vec<bool>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<ClientShared>, origin: Arc<Origin>, pool_size: usize) -> Self {
        let conns = (0..pool_size)
            .map(|index| Connection::new(index, Arc::clone(&origin), shared.debug_flag()))
            .collect();
        Self {
            shared,
            conns,
            available: (0..pool_size).collect(),
            on_free_list: vec![true; pool_size],
        }
    }

    /// Puts a connection back on the free list once its request is done.
    /// Indices only leave the list through `drain`, so this never needs to
    /// remove one.
    fn sync(&mut self, index: usize) {
        if self.conns[index].is_available() && !self.on_free_list[index] {
            self.on_free_list[index] = true;
            self.available.push(index);
        }
    }

    /// Assigns queued requests until the queue is empty or no connection is
    /// available. Runs after every submission wake and every connection
    /// event, so nested submissions from callbacks are picked up as soon as
    /// the callback returns.
    fn drain(&mut self, ctx: &mut LoopCtx<'_>) {
        loop {
            let Some(&index) = self.available.last() else {
                return;
            };
            let Some(handle) = self.shared.queue.pop() else {
                return;
            };
            if self.shared.debug_enabled() {
                tracing::debug!(
                    conn = index,
                    method = handle.request.method.as_str(),
                    target = %handle.request.target(),
                    queued = self.shared.queue.len(),
                    "dispatching request"
                );
            }
            self.available.pop();
            self.on_free_list[index] = false;
            self.conns[index].assign(ctx, handle);
            // An immediate failure finishes inline and frees the slot again.
            self.sync(index);
        }
    }
}

impl Driver for Dispatcher {
    fn on_start(&mut self, ctx: &mut LoopCtx<'_>) {
        self.drain(ctx);
    }

    fn on_wake(&mut self, ctx: &mut LoopCtx<'_>) {
        self.drain(ctx);
    }

    fn on_io(&mut self, ctx: &mut LoopCtx<'_>, tag: u64, readable: bool, writable: bool) {
        let index = tag as usize;
        if index >= self.conns.len() {
            return;
        }
        self.conns[index].handle_io(ctx, readable, writable);
        self.sync(index);
        self.drain(ctx);
    }

    fn on_timer(&mut self, ctx: &mut LoopCtx<'_>, tag: u64) {
        let index = tag as usize;
        if index >= self.conns.len() {
            return;
        }
        self.conns[index].handle_timeout(ctx);
        self.sync(index);
        self.drain(ctx);
    }

    fn is_idle(&self) -> bool {
        self.shared.queue.is_empty() && self.conns.iter().all(Connection::is_available)
    }

    fn on_shutdown(&mut self, ctx: &mut LoopCtx<'_>) {
        for conn in &mut self.conns {
            conn.close(ctx);
        }
    }
}
