//! Deterministic simulated board for host tests.
//!
//! Time is virtual and only moves inside [`SimBoard::advance_us`] and
//! friends. Timer expiries, scheduled stimuli and edge interrupts are
//! delivered in time order; events due at the same instant run in the order
//! they were scheduled, and an edge already latched runs before anything
//! else due at that instant.
//!
//! Input lines attach to the pin's edge hub and, as with the GPIO ISR
//! service, a pin holds at most one interrupt handler: the hub's. It is
//! installed with the first line and removed with the last.
//!
//! Each pin has a mode, the level the engine drives, and an optional level
//! applied from outside (a test stimulus or a wire). An output line is the
//! wired-AND of both; an input line follows the outside level and idles
//! high through its pull-up.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::edge::{EdgeHandle, EdgeHub, EdgeRegistry};
use crate::error::Result;
use crate::gpio::{EdgeCallback, InputLine, Level, OutputLine, PinId, Platform};
use crate::timer::{SeqTimer, TimeUnit, TimerCallback};

#[derive(Clone, Default)]
pub struct SimBoard {
    world: Arc<Mutex<World>>,
    edges: Arc<EdgeRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PinMode {
    #[default]
    Unused,
    Output,
    Input,
}

#[derive(Debug, Clone, Copy, Default)]
struct PinState {
    mode: PinMode,
    driven: Option<Level>,
    external: Option<Level>,
    line: Option<Level>,
}

impl PinState {
    fn resolve(&self) -> Level {
        let outside = self.external.unwrap_or(Level::High);
        match (self.mode, self.driven) {
            (PinMode::Output, Some(Level::Low)) => Level::Low,
            _ => outside,
        }
    }
}

/// A line level change, in virtual microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    pub at_us: u64,
    pub pin: PinId,
    pub level: Level,
}

struct TimerSlot {
    name: &'static str,
    callback: Option<TimerCallback>,
    generation: u64,
    period_us: Option<u64>,
}

#[derive(Debug)]
enum EventKind {
    TimerFire { id: usize, generation: u64 },
    Drive { pin: PinId, level: Option<Level> },
}

#[derive(Debug)]
struct Scheduled {
    due: u64,
    order: u64,
    kind: EventKind,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.order) == (other.due, other.order)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.order).cmp(&(other.due, other.order))
    }
}

enum Action {
    Timer(usize),
    Edge(Arc<EdgeHub>),
}

#[derive(Default)]
struct World {
    now: u64,
    next_order: u64,
    next_id: usize,
    events: BinaryHeap<Reverse<Scheduled>>,
    latched: VecDeque<PinId>,
    pins: HashMap<PinId, PinState>,
    wires: Vec<(PinId, PinId)>,
    timers: HashMap<usize, TimerSlot>,
    /// Interrupt handler per pin. Installing a second one replaces the
    /// first, as `gpio_isr_handler_add` does.
    handlers: HashMap<PinId, Arc<EdgeHub>>,
    fires: HashMap<&'static str, usize>,
    trace: Vec<LevelChange>,
}

impl World {
    fn schedule(&mut self, due: u64, kind: EventKind) {
        let order = self.next_order;
        self.next_order += 1;
        self.events.push(Reverse(Scheduled { due, order, kind }));
    }

    fn alloc_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn level(&self, pin: PinId) -> Level {
        self.pins.get(&pin).map(PinState::resolve).unwrap_or(Level::High)
    }

    /// Apply a pin change and propagate it through wires, latching an edge
    /// on every pin whose line level moved while its interrupt is enabled.
    fn update(&mut self, pin: PinId, change: impl FnOnce(&mut PinState)) {
        let state = self.pins.entry(pin).or_default();
        change(state);
        let mut work = vec![pin];
        // Bounded so a wiring loop cannot spin forever.
        let mut budget = 64;
        while let Some(pin) = work.pop() {
            if budget == 0 {
                break;
            }
            budget -= 1;
            let state = self.pins.entry(pin).or_default();
            let level = state.resolve();
            if state.line == Some(level) || (state.line.is_none() && level == Level::High) {
                state.line = Some(level);
                continue;
            }
            state.line = Some(level);
            trace!("sim: {}us GPIO{} -> {}", self.now, pin, level);
            self.trace.push(LevelChange {
                at_us: self.now,
                pin,
                level,
            });
            if self.handlers.get(&pin).is_some_and(|hub| hub.any_enabled()) {
                self.latched.push_back(pin);
            }
            let targets: Vec<PinId> = self
                .wires
                .iter()
                .filter(|(from, _)| *from == pin)
                .map(|(_, to)| *to)
                .collect();
            for to in targets {
                self.pins.entry(to).or_default().external = Some(level);
                work.push(to);
            }
        }
    }

    /// Next thing to run, or `None` once nothing is due by `until`.
    fn step(&mut self, until: u64) -> Option<Action> {
        loop {
            if let Some(pin) = self.latched.pop_front() {
                match self.handlers.get(&pin) {
                    Some(hub) if hub.any_enabled() => return Some(Action::Edge(hub.clone())),
                    _ => continue,
                }
            }
            let due = match self.events.peek() {
                Some(Reverse(next)) if next.due <= until => next.due,
                _ => return None,
            };
            let Some(Reverse(event)) = self.events.pop() else {
                return None;
            };
            self.now = self.now.max(due);
            match event.kind {
                EventKind::Drive { pin, level } => {
                    self.update(pin, |state| state.external = level);
                }
                EventKind::TimerFire { id, generation } => {
                    let Some(slot) = self.timers.get_mut(&id) else {
                        continue;
                    };
                    if slot.generation != generation {
                        continue;
                    }
                    let name = slot.name;
                    let period = slot.period_us;
                    if period.is_none() {
                        slot.generation += 1;
                    }
                    if let Some(period) = period {
                        let next = due + period.max(1);
                        self.schedule(next, EventKind::TimerFire { id, generation });
                    }
                    *self.fires.entry(name).or_default() += 1;
                    return Some(Action::Timer(id));
                }
            }
        }
    }
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now_us(&self) -> u64 {
        self.world().now
    }

    pub fn advance_us(&self, us: u64) {
        let until = self.now_us() + us;
        self.run_until(until);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1_000);
    }

    /// Run every event due up to and including `until_us`. Callbacks run
    /// with the board unlocked, so they may arm timers and drive pins.
    pub fn run_until(&self, until_us: u64) {
        loop {
            let action = self.world().step(until_us);
            match action {
                Some(Action::Timer(id)) => self.fire_timer(id),
                Some(Action::Edge(hub)) => hub.dispatch(),
                None => break,
            }
        }
        let mut world = self.world();
        world.now = world.now.max(until_us);
    }

    fn fire_timer(&self, id: usize) {
        let taken = self
            .world()
            .timers
            .get_mut(&id)
            .and_then(|slot| slot.callback.take());
        let Some(mut callback) = taken else {
            return;
        };
        callback();
        let unused = {
            let mut world = self.world();
            match world.timers.get_mut(&id) {
                Some(slot) if slot.callback.is_none() => {
                    slot.callback = Some(callback);
                    None
                }
                _ => Some(callback),
            }
        };
        drop(unused);
    }

    /// Apply `level` to `pin` from outside, now.
    pub fn drive(&self, pin: PinId, level: Level) {
        self.world().update(pin, |state| state.external = Some(level));
    }

    /// Stop driving `pin` from outside; it floats back to its pull-up.
    pub fn release(&self, pin: PinId) {
        self.world().update(pin, |state| state.external = None);
    }

    /// Apply `level` to `pin` from outside at virtual time `at_us`.
    pub fn drive_at(&self, pin: PinId, level: Level, at_us: u64) {
        let mut world = self.world();
        let due = at_us.max(world.now);
        world.schedule(
            due,
            EventKind::Drive {
                pin,
                level: Some(level),
            },
        );
    }

    /// Loop `from`'s line level into `to`, as with a jumper wire.
    pub fn wire(&self, from: PinId, to: PinId) {
        let mut world = self.world();
        world.wires.push((from, to));
        let level = world.level(from);
        world.update(to, |state| state.external = Some(level));
    }

    pub fn level(&self, pin: PinId) -> Level {
        self.world().level(pin)
    }

    /// Every line level change so far.
    pub fn trace(&self) -> Vec<LevelChange> {
        self.world().trace.clone()
    }

    pub fn trace_of(&self, pin: PinId) -> Vec<(u64, Level)> {
        self.world()
            .trace
            .iter()
            .filter(|change| change.pin == pin)
            .map(|change| (change.at_us, change.level))
            .collect()
    }

    /// Expiries delivered so far by timers created under `name`.
    pub fn timer_fires(&self, name: &str) -> usize {
        self.world().fires.get(name).copied().unwrap_or(0)
    }

    /// Whether any input line on `pin` has its edge interrupt enabled.
    pub fn edge_enabled(&self, pin: PinId) -> bool {
        self.world()
            .handlers
            .get(&pin)
            .is_some_and(|hub| hub.any_enabled())
    }

    /// Whether `pin` currently has an interrupt handler installed.
    pub fn edge_handler_installed(&self, pin: PinId) -> bool {
        self.world().handlers.contains_key(&pin)
    }
}

impl Platform for SimBoard {
    fn now_us(&self) -> u64 {
        SimBoard::now_us(self)
    }

    fn output_line(&self, pin: PinId) -> Result<Box<dyn OutputLine>> {
        Ok(Box::new(SimOutputLine {
            board: self.clone(),
            pin,
        }))
    }

    fn input_line(&self, pin: PinId) -> Result<Box<dyn InputLine>> {
        let edge = self.edges.attach(pin, |hub| {
            self.world().handlers.insert(pin, hub.clone());
            Ok(())
        })?;
        Ok(Box::new(SimInputLine {
            board: self.clone(),
            pin,
            edge,
        }))
    }

    fn timer(&self, name: &'static str) -> Result<Box<dyn SeqTimer>> {
        let id = {
            let mut world = self.world();
            let id = world.alloc_id();
            world.timers.insert(
                id,
                TimerSlot {
                    name,
                    callback: None,
                    generation: 0,
                    period_us: None,
                },
            );
            id
        };
        Ok(Box::new(SimTimer {
            board: self.clone(),
            id,
        }))
    }
}

pub struct SimOutputLine {
    board: SimBoard,
    pin: PinId,
}

impl OutputLine for SimOutputLine {
    fn set_level(&mut self, level: Level) {
        self.board.world().update(self.pin, |state| {
            state.mode = PinMode::Output;
            state.driven = Some(level);
        });
    }
}

pub struct SimInputLine {
    board: SimBoard,
    pin: PinId,
    edge: EdgeHandle,
}

impl InputLine for SimInputLine {
    fn configure(&mut self) {
        self.board.world().update(self.pin, |state| {
            state.mode = PinMode::Input;
            state.driven = None;
        });
    }

    fn level(&self) -> Level {
        self.board.level(self.pin)
    }

    fn set_edge_callback(&mut self, on_edge: EdgeCallback) {
        drop(self.edge.hub.set_callback(self.edge.id, on_edge));
    }

    fn enable_edges(&mut self) {
        self.edge.hub.set_enabled(self.edge.id, true);
    }

    fn disable_edges(&mut self) {
        self.edge.hub.set_enabled(self.edge.id, false);
    }
}

impl Drop for SimInputLine {
    fn drop(&mut self) {
        let board = &self.board;
        board.edges.detach(&self.edge, |pin| {
            let removed = board.world().handlers.remove(&pin);
            drop(removed);
        });
    }
}

pub struct SimTimer {
    board: SimBoard,
    id: usize,
}

impl SeqTimer for SimTimer {
    fn arm(&self, interval: u32, unit: TimeUnit, repeat: bool) {
        let mut world = self.board.world();
        let period = unit.to_micros(interval);
        let due = world.now + period;
        let Some(slot) = world.timers.get_mut(&self.id) else {
            return;
        };
        slot.generation += 1;
        slot.period_us = repeat.then_some(period);
        let generation = slot.generation;
        world.schedule(
            due,
            EventKind::TimerFire {
                id: self.id,
                generation,
            },
        );
    }

    fn disarm(&self) {
        if let Some(slot) = self.board.world().timers.get_mut(&self.id) {
            slot.generation += 1;
            slot.period_us = None;
        }
    }

    fn set_callback(&self, callback: TimerCallback) {
        let previous = self
            .board
            .world()
            .timers
            .get_mut(&self.id)
            .and_then(|slot| slot.callback.replace(callback));
        drop(previous);
    }
}

impl Drop for SimTimer {
    fn drop(&mut self) {
        let removed = self.board.world().timers.remove(&self.id);
        drop(removed);
    }
}
