//! Per-connection write buffers
//!
//! `OutputBuffer` keeps bytes until the transport pulls them and only asks
//! the transport for attention while it holds data. `PushBuffer` hands bytes
//! straight to a transport that can report when its own queue drains.

use crate::transport::Transport;
use bytes::Bytes;
use log::warn;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Something a transport pulls outgoing bytes from.
pub(crate) trait Producer {
    /// The transport can take more data now.
    fn resume_producing(&self);
}

/// Contract a connection writes through, whichever buffer backs it.
pub(crate) trait WriteBuffer {
    fn add(&self, chunk: Bytes);

    /// Nothing is waiting to be handed to the OS.
    fn is_flushed(&self) -> bool;

    /// Stop asking the transport for write attention.
    fn stop_writing(&self);

    /// Hand everything still queued to the transport right away.
    fn handoff(&self);

    /// Forget the transport and drop whatever is still queued.
    fn detach(&self);
}

/// Pull-mode buffer with an unbounded queue.
///
/// The flush callback fires every time the queue goes from non-empty to
/// empty.
pub(crate) struct OutputBuffer {
    consumer: RefCell<Option<Rc<dyn Transport>>>,
    registered: Cell<bool>,
    queue: RefCell<Vec<Bytes>>,
    on_flushed: Rc<dyn Fn()>,
    this: Weak<OutputBuffer>,
}

impl OutputBuffer {
    pub(crate) fn new(on_flushed: Rc<dyn Fn()>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            consumer: RefCell::new(None),
            registered: Cell::new(false),
            queue: RefCell::new(Vec::new()),
            on_flushed,
            this: this.clone(),
        })
    }

    /// Start feeding `consumer`. Bytes queued before this point are offered
    /// immediately.
    pub(crate) fn attach_consumer(&self, consumer: Rc<dyn Transport>) {
        *self.consumer.borrow_mut() = Some(consumer);
        if !self.queue.borrow().is_empty() {
            self.begin_writing();
        }
    }

    /// Remove and return everything still queued.
    pub(crate) fn take_pending(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }

    fn consumer(&self) -> Option<Rc<dyn Transport>> {
        self.consumer.borrow().clone()
    }

    fn begin_writing(&self) {
        self.stop_writing();
        let Some(consumer) = self.consumer() else {
            return;
        };
        self.registered.set(true);
        let producer: Weak<dyn Producer> = self.this.clone();
        consumer.register_producer(producer);
    }

    fn write_out(&self, consumer: &dyn Transport) -> bool {
        let chunks = self.take_pending();
        if chunks.is_empty() {
            return false;
        }
        if let Err(e) = consumer.write_sequence(chunks) {
            warn!("write failed: {e}");
        }
        true
    }
}

impl Producer for OutputBuffer {
    fn resume_producing(&self) {
        if !self.registered.get() {
            return;
        }
        let Some(consumer) = self.consumer() else {
            return;
        };
        if self.write_out(consumer.as_ref()) {
            (self.on_flushed)();
        } else {
            self.stop_writing();
        }
    }
}

impl WriteBuffer for OutputBuffer {
    fn add(&self, chunk: Bytes) {
        self.queue.borrow_mut().push(chunk);
        if !self.registered.get() && self.consumer.borrow().is_some() {
            self.begin_writing();
        }
    }

    fn is_flushed(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn stop_writing(&self) {
        if !self.registered.replace(false) {
            return;
        }
        if let Some(consumer) = self.consumer() {
            consumer.unregister_producer();
        }
    }

    fn handoff(&self) {
        let Some(consumer) = self.consumer() else {
            return;
        };
        if self.write_out(consumer.as_ref()) {
            (self.on_flushed)();
        }
    }

    fn detach(&self) {
        self.stop_writing();
        self.consumer.borrow_mut().take();
        self.queue.borrow_mut().clear();
    }
}

/// Push-mode buffer over a transport that keeps its own queue.
pub(crate) struct PushBuffer {
    consumer: RefCell<Option<Rc<dyn Transport>>>,
    flushed: Rc<Cell<bool>>,
}

impl PushBuffer {
    /// Take over from `previous`, forwarding anything it still holds.
    /// Returns `None` if `consumer` cannot report drains.
    pub(crate) fn attach(
        consumer: Rc<dyn Transport>,
        on_flushed: Rc<dyn Fn()>,
        previous: &OutputBuffer,
    ) -> Option<Self> {
        let flushed = Rc::new(Cell::new(true));
        let weak = Rc::downgrade(&flushed);
        let drained = Box::new(move || {
            if let Some(flushed) = weak.upgrade() {
                if !flushed.replace(true) {
                    on_flushed();
                }
            }
        });
        if !consumer.add_buffer_callback(drained) {
            return None;
        }
        previous.stop_writing();
        let buffer = Self {
            consumer: RefCell::new(Some(consumer)),
            flushed,
        };
        for chunk in previous.take_pending() {
            buffer.add(chunk);
        }
        Some(buffer)
    }
}

impl WriteBuffer for PushBuffer {
    fn add(&self, chunk: Bytes) {
        let Some(consumer) = self.consumer.borrow().clone() else {
            return;
        };
        if chunk.is_empty() {
            return;
        }
        match consumer.write(chunk) {
            Ok(()) => self.flushed.set(false),
            Err(e) => warn!("write failed: {e}"),
        }
    }

    fn is_flushed(&self) -> bool {
        self.flushed.get()
    }

    fn stop_writing(&self) {}

    fn handoff(&self) {}

    fn detach(&self) {
        self.consumer.borrow_mut().take();
        self.flushed.set(true);
    }
}
