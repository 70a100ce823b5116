//! Edge fan-out for pins shared by several input lines.
//!
//! The GPIO ISR service keeps a single handler per pin, so a second
//! `gpio_isr_handler_add` on the same pin replaces the first and a
//! `gpio_isr_handler_remove` silences every line on it. Each pin therefore
//! gets one [`EdgeHub`]: the interrupt handler is installed when the first
//! line attaches, every edge is handed to the lines whose edges are enabled,
//! and the handler is removed when the last line detaches.

use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use critical_section::Mutex;

use crate::error::{DioError, Result};
use crate::gpio::{EdgeCallback, PinId};

/// Input lines one pin can carry at once.
pub const MAX_LINES_PER_PIN: usize = 4;

struct Listener {
    id: usize,
    enabled: bool,
    callback: Option<EdgeCallback>,
}

#[derive(Default)]
struct Lines {
    next_id: usize,
    listeners: heapless::Vec<Listener, MAX_LINES_PER_PIN>,
}

/// The lines attached to one pin. Dispatch is allocation free and safe from
/// interrupt context.
pub struct EdgeHub {
    pin: PinId,
    lines: Mutex<RefCell<Lines>>,
    // Mirrors the enabled flags so the board can ask without a critical
    // section.
    enabled: AtomicUsize,
}

impl EdgeHub {
    fn new(pin: PinId) -> Self {
        Self {
            pin,
            lines: Mutex::new(RefCell::new(Lines::default())),
            enabled: AtomicUsize::new(0),
        }
    }

    fn pin(&self) -> PinId {
        self.pin
    }

    fn attach(&self) -> Result<usize> {
        critical_section::with(|cs| -> Result<usize> {
            let mut lines = self.lines.borrow_ref_mut(cs);
            lines.next_id += 1;
            let id = lines.next_id;
            lines
                .listeners
                .push(Listener {
                    id,
                    enabled: false,
                    callback: None,
                })
                .map_err(|_| DioError::CapacityExceeded {
                    capacity: MAX_LINES_PER_PIN,
                })?;
            Ok(id)
        })
    }

    /// Removes line `id`. Returns its callback, to be dropped by the caller
    /// outside the critical section, and whether the pin has no lines left.
    fn detach(&self, id: usize) -> (Option<EdgeCallback>, bool) {
        critical_section::with(|cs| {
            let mut lines = self.lines.borrow_ref_mut(cs);
            let removed = lines
                .listeners
                .iter()
                .position(|l| l.id == id)
                .map(|at| lines.listeners.remove(at));
            let callback = removed.and_then(|listener| {
                if listener.enabled {
                    self.enabled.fetch_sub(1, Ordering::AcqRel);
                }
                listener.callback
            });
            (callback, lines.listeners.is_empty())
        })
    }

    /// Replaces the callback of line `id`, returning the previous one.
    pub fn set_callback(&self, id: usize, callback: EdgeCallback) -> Option<EdgeCallback> {
        critical_section::with(|cs| {
            let mut lines = self.lines.borrow_ref_mut(cs);
            lines
                .listeners
                .iter_mut()
                .find(|l| l.id == id)
                .and_then(|l| l.callback.replace(callback))
        })
    }

    /// Turns edge delivery to line `id` on or off. Returns whether any line
    /// on the pin still wants edges.
    pub fn set_enabled(&self, id: usize, on: bool) -> bool {
        critical_section::with(|cs| {
            let mut lines = self.lines.borrow_ref_mut(cs);
            if let Some(listener) = lines.listeners.iter_mut().find(|l| l.id == id) {
                if listener.enabled != on {
                    listener.enabled = on;
                    if on {
                        self.enabled.fetch_add(1, Ordering::AcqRel);
                    } else {
                        self.enabled.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        });
        self.any_enabled()
    }

    pub fn any_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) > 0
    }

    /// Runs the callback of every enabled line, in attach order. Each
    /// callback is taken out of its slot and runs outside the critical
    /// section, so it may disable edges or detach its own line.
    pub fn dispatch(&self) {
        let targets: heapless::Vec<usize, MAX_LINES_PER_PIN> = critical_section::with(|cs| {
            self.lines
                .borrow_ref(cs)
                .listeners
                .iter()
                .filter(|l| l.enabled)
                .map(|l| l.id)
                .collect()
        });
        for id in targets {
            let taken = critical_section::with(|cs| {
                let mut lines = self.lines.borrow_ref_mut(cs);
                lines
                    .listeners
                    .iter_mut()
                    .find(|l| l.id == id && l.enabled)
                    .and_then(|l| l.callback.take())
            });
            let Some(mut callback) = taken else {
                continue;
            };
            callback();
            let unused = critical_section::with(|cs| {
                let mut lines = self.lines.borrow_ref_mut(cs);
                match lines.listeners.iter_mut().find(|l| l.id == id) {
                    Some(listener) if listener.callback.is_none() => {
                        listener.callback = Some(callback);
                        None
                    }
                    _ => Some(callback),
                }
            });
            drop(unused);
        }
    }
}

/// A line's membership in a pin's hub.
pub struct EdgeHandle {
    pub hub: Arc<EdgeHub>,
    pub id: usize,
}

/// One hub per pin, created on first attach and dropped on last detach.
#[derive(Default)]
pub struct EdgeRegistry {
    hubs: StdMutex<HashMap<PinId, Arc<EdgeHub>>>,
}

impl EdgeRegistry {
    /// Attaches a new line to `pin`. `install` runs only when the pin has no
    /// hub yet and must route the pin's interrupt to [`EdgeHub::dispatch`].
    pub fn attach(
        &self,
        pin: PinId,
        install: impl FnOnce(&Arc<EdgeHub>) -> Result<()>,
    ) -> Result<EdgeHandle> {
        let mut hubs = self.hubs.lock().unwrap_or_else(PoisonError::into_inner);
        let hub = match hubs.get(&pin) {
            Some(hub) => hub.clone(),
            None => {
                let hub = Arc::new(EdgeHub::new(pin));
                install(&hub)?;
                hubs.insert(pin, hub.clone());
                hub
            }
        };
        let id = hub.attach()?;
        Ok(EdgeHandle { hub, id })
    }

    /// Detaches a line. When it was the last one on the pin, `uninstall`
    /// runs before the hub is released.
    pub fn detach(&self, handle: &EdgeHandle, uninstall: impl FnOnce(PinId)) {
        let pin = handle.hub.pin();
        let callback = {
            let mut hubs = self.hubs.lock().unwrap_or_else(PoisonError::into_inner);
            let (callback, empty) = handle.hub.detach(handle.id);
            let current = hubs.get(&pin).is_some_and(|hub| Arc::ptr_eq(hub, &handle.hub));
            if empty && current {
                uninstall(pin);
                hubs.remove(&pin);
            }
            callback
        };
        drop(callback);
    }

    #[cfg(test)]
    fn lines_on(&self, pin: PinId) -> bool {
        self.hubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(hub: &EdgeHub, id: usize) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        hub.set_callback(
            id,
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn handler_is_installed_once_and_removed_with_the_last_line() {
        let registry = EdgeRegistry::default();
        let installs = AtomicUsize::new(0);
        let removals = AtomicUsize::new(0);
        let install = |_: &Arc<EdgeHub>| -> Result<()> {
            installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        let first = registry.attach(4, install).unwrap();
        let second = registry.attach(4, install).unwrap();
        assert!(Arc::ptr_eq(&first.hub, &second.hub));
        assert_eq!(installs.load(Ordering::SeqCst), 1);

        registry.detach(&second, |_| {
            removals.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(removals.load(Ordering::SeqCst), 0);
        assert!(registry.lines_on(4));

        registry.detach(&first, |pin| {
            assert_eq!(pin, 4);
            removals.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert!(!registry.lines_on(4));
    }

    #[test]
    fn edges_reach_every_enabled_line() {
        let registry = EdgeRegistry::default();
        let a = registry.attach(4, |_| Ok(())).unwrap();
        let b = registry.attach(4, |_| Ok(())).unwrap();
        let hub = a.hub.clone();
        let hits_a = counting(&hub, a.id);
        let hits_b = counting(&hub, b.id);

        hub.dispatch();
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);

        assert!(hub.set_enabled(a.id, true));
        assert!(hub.set_enabled(b.id, true));
        hub.dispatch();
        assert!(hub.set_enabled(b.id, false));
        hub.dispatch();
        assert!(!hub.set_enabled(a.id, false));

        assert_eq!(hits_a.load(Ordering::SeqCst), 2);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detaching_one_line_leaves_the_others_wired() {
        let registry = EdgeRegistry::default();
        let kept = registry.attach(4, |_| Ok(())).unwrap();
        let gone = registry.attach(4, |_| Ok(())).unwrap();
        let hub = kept.hub.clone();
        let hits = counting(&hub, kept.id);
        hub.set_enabled(kept.id, true);
        hub.set_enabled(gone.id, true);

        registry.detach(&gone, |_| panic!("pin still in use"));
        assert!(hub.any_enabled());
        hub.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_full_pin_refuses_more_lines() {
        let registry = EdgeRegistry::default();
        let lines: Vec<EdgeHandle> = (0..MAX_LINES_PER_PIN)
            .map(|_| registry.attach(4, |_| Ok(())).unwrap())
            .collect();
        assert_eq!(
            registry.attach(4, |_| Ok(())).err(),
            Some(DioError::CapacityExceeded {
                capacity: MAX_LINES_PER_PIN
            })
        );
        assert_eq!(lines.len(), MAX_LINES_PER_PIN);
    }

    #[test]
    fn failed_install_leaves_no_hub() {
        let registry = EdgeRegistry::default();
        let err = registry
            .attach(4, |_| Err(DioError::Platform("no isr".into())))
            .err();
        assert_eq!(err, Some(DioError::Platform("no isr".into())));
        assert!(!registry.lines_on(4));
    }

    #[test]
    fn a_callback_may_disable_its_own_line() {
        let registry = EdgeRegistry::default();
        let line = registry.attach(4, |_| Ok(())).unwrap();
        let hub = line.hub.clone();
        let id = line.id;
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        let inner = hub.clone();
        hub.set_callback(
            id,
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                inner.set_enabled(id, false);
            }),
        );
        hub.set_enabled(id, true);
        hub.dispatch();
        hub.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!hub.any_enabled());
    }
}
