//! Deferred dispatch of sequence completions.
//!
//! Edge interrupts and timer expiries only push a [`DioEvent`] here; the
//! `dio_task` worker pops events one at a time and runs the user callback
//! outside interrupt context, where decoding a buffer or scheduling the next
//! sequence is safe.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, PoisonError};
use std::thread::{self, JoinHandle};

use critical_section::Mutex;
use heapless::Deque;
use log::{debug, error, info};

use crate::di_seq::DiSeq;
use crate::do_seq::DoSeq;

pub const DIO_TASK_QUEUE_LEN: usize = 8;
pub const DIO_TASK_STACK_SIZE: usize = 6 * 1024;

/// Where a completion callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Synchronously, in the timer / edge interrupt context that completed
    /// the sequence.
    Direct,
    /// On the `dio_task` worker, via the dispatch queue.
    #[default]
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    OutputDone,
    InputDone,
}

/// A completion travelling from interrupt context to the worker. Holds a
/// strong handle, so the sequence outlives the trip even if its owner
/// dropped it after `start`.
pub enum DioEvent {
    OutputDone(DoSeq),
    InputDone(DiSeq),
}

impl DioEvent {
    pub fn signal(&self) -> Signal {
        match self {
            DioEvent::OutputDone(_) => Signal::OutputDone,
            DioEvent::InputDone(_) => Signal::InputDone,
        }
    }

    fn dispatch(self) {
        match self {
            DioEvent::OutputDone(seq) => seq.fire_callback(),
            DioEvent::InputDone(seq) => {
                // The edge handler already disarmed it; a late timeout must
                // not race the callback.
                seq.stop_timeout();
                seq.fire_callback();
            }
        }
    }
}

/// Wakes the worker. `ring` must be callable from interrupt context.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
    /// Blocks until rung at least once since the previous `wait`.
    fn wait(&self);
}

/// Doorbell for hosts with a real thread scheduler.
#[derive(Default)]
pub struct CondvarDoorbell {
    rung: StdMutex<bool>,
    cv: Condvar,
}

impl Doorbell for CondvarDoorbell {
    fn ring(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        *rung = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        while !*rung {
            rung = self.cv.wait(rung).unwrap_or_else(PoisonError::into_inner);
        }
        *rung = false;
    }
}

pub type OverflowHook = fn(Signal);

/// Default overflow hook. There is no backpressure below the application,
/// so a full queue is a fatal condition; on target the panic resets the chip.
pub fn fatal_overflow(signal: Signal) {
    error!("dio_task queue exhausted ({} slots), dropping {:?}", DIO_TASK_QUEUE_LEN, signal);
    panic!("dio_task queue overflow");
}

pub struct DioQueue {
    events: Mutex<RefCell<Deque<DioEvent, DIO_TASK_QUEUE_LEN>>>,
    doorbell: Box<dyn Doorbell>,
    on_overflow: OverflowHook,
    high_water: AtomicUsize,
}

impl DioQueue {
    pub fn new(doorbell: Box<dyn Doorbell>) -> Self {
        Self {
            events: Mutex::new(RefCell::new(Deque::new())),
            doorbell,
            on_overflow: fatal_overflow,
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn with_overflow_hook(mut self, hook: OverflowHook) -> Self {
        self.on_overflow = hook;
        self
    }

    /// Non-blocking and allocation free; safe from interrupt context.
    pub fn enqueue(&self, event: DioEvent) {
        let signal = event.signal();
        let queued = critical_section::with(|cs| {
            let mut events = self.events.borrow_ref_mut(cs);
            match events.push_back(event) {
                Ok(()) => Ok(events.len()),
                Err(rejected) => Err(rejected),
            }
        });
        match queued {
            Ok(depth) => {
                self.high_water.fetch_max(depth, Ordering::Relaxed);
                self.doorbell.ring();
            }
            Err(rejected) => {
                drop(rejected);
                (self.on_overflow)(signal);
            }
        }
    }

    pub fn pop(&self) -> Option<DioEvent> {
        critical_section::with(|cs| self.events.borrow_ref_mut(cs).pop_front())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.events.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deepest the queue has been since creation.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Dispatch everything queued so far on the calling (task) context.
    /// Returns the number of events handled.
    pub fn run_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.pop() {
            debug!("dio_task: {:?}", event.signal());
            event.dispatch();
            handled += 1;
        }
        handled
    }

    pub fn wait(&self) {
        self.doorbell.wait();
    }
}

/// Start the `dio_task` worker draining `queue` for the life of the program.
pub fn spawn(queue: Arc<DioQueue>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dio_task".into())
        .stack_size(DIO_TASK_STACK_SIZE)
        .spawn(move || {
            info!("dio_task started ({} slots)", DIO_TASK_QUEUE_LEN);
            loop {
                queue.wait();
                queue.run_pending();
            }
        })
}

/// Registered completion of a sequence of type `S`.
pub(crate) struct Completion<S> {
    callback: Option<Box<dyn FnMut(&S) + Send>>,
    mode: DispatchMode,
}

impl<S> Completion<S> {
    pub(crate) fn new() -> Self {
        Self {
            callback: None,
            mode: DispatchMode::default(),
        }
    }
}

pub(crate) type CompletionSlot<S> = Mutex<RefCell<Completion<S>>>;

pub(crate) fn set_completion<S>(
    slot: &CompletionSlot<S>,
    callback: Box<dyn FnMut(&S) + Send>,
    mode: DispatchMode,
) {
    let previous = critical_section::with(|cs| {
        let mut completion = slot.borrow_ref_mut(cs);
        completion.mode = mode;
        completion.callback.replace(callback)
    });
    drop(previous);
}

pub(crate) fn completion_mode<S>(slot: &CompletionSlot<S>) -> DispatchMode {
    critical_section::with(|cs| slot.borrow_ref(cs).mode)
}

/// Run the registered callback outside any critical section. A callback
/// that registers a replacement for itself keeps the replacement.
pub(crate) fn fire_completion<S>(slot: &CompletionSlot<S>, seq: &S) {
    let taken = critical_section::with(|cs| slot.borrow_ref_mut(cs).callback.take());
    let Some(mut callback) = taken else {
        debug!("sequence completed without a callback");
        return;
    };
    callback(seq);
    let unused = critical_section::with(|cs| {
        let mut completion = slot.borrow_ref_mut(cs);
        if completion.callback.is_none() {
            completion.callback = Some(callback);
            None
        } else {
            Some(callback)
        }
    });
    drop(unused);
}
