//! ESP-IDF backend: raw GPIO with the shared ISR service, `esp_timer` for
//! pacing and a FreeRTOS binary semaphore as the dispatch doorbell.

use core::cell::RefCell;
use core::ffi::{c_void, CStr};
use core::ptr;
use std::ffi::CString;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use critical_section::Mutex;
use esp_idf_hal::delay::BLOCK;
use esp_idf_sys as sys;
use log::{info, warn};

use crate::dio_task::Doorbell;
use crate::edge::{EdgeHandle, EdgeHub, EdgeRegistry};
use crate::error::{DioError, Result};
use crate::gpio::{EdgeCallback, InputLine, Level, OutputLine, PinId, Platform};
use crate::timer::{SeqTimer, TimeUnit, TimerCallback};

const QUEUE_TYPE_BINARY_SEMAPHORE: u8 = 3;
const QUEUE_SEND_TO_BACK: sys::BaseType_t = 0;

fn platform_err(what: &str, err: sys::EspError) -> DioError {
    DioError::Platform(format!("{what}: {err}"))
}

pub struct EspPlatform {
    edges: Arc<EdgeRegistry>,
}

impl EspPlatform {
    /// Installs the per-pin GPIO ISR service. Safe to call more than once.
    pub fn new() -> Result<Self> {
        let err = unsafe { sys::gpio_install_isr_service(0) };
        // Already installed by someone else is fine.
        if err != sys::ESP_ERR_INVALID_STATE as sys::esp_err_t {
            sys::esp!(err).map_err(|err| platform_err("gpio_install_isr_service", err))?;
        }
        info!("esp: GPIO ISR service ready");
        Ok(Self {
            edges: Arc::default(),
        })
    }
}

impl Platform for EspPlatform {
    fn now_us(&self) -> u64 {
        unsafe { sys::esp_timer_get_time() as u64 }
    }

    /// Wall clock once SNTP has synced, uptime before that.
    fn timestamp(&self) -> u32 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) if elapsed.as_secs() > 1_600_000_000 => elapsed.as_secs() as u32,
            _ => (self.now_us() / 1_000_000) as u32,
        }
    }

    fn output_line(&self, pin: PinId) -> Result<Box<dyn OutputLine>> {
        Ok(Box::new(EspOutputLine { pin }))
    }

    fn input_line(&self, pin: PinId) -> Result<Box<dyn InputLine>> {
        EspInputLine::new(pin, self.edges.clone()).map(|line| Box::new(line) as Box<dyn InputLine>)
    }

    fn timer(&self, name: &'static str) -> Result<Box<dyn SeqTimer>> {
        EspSeqTimer::new(name).map(|timer| Box::new(timer) as Box<dyn SeqTimer>)
    }

    fn doorbell(&self) -> Result<Box<dyn Doorbell>> {
        SemaphoreDoorbell::new().map(|bell| Box::new(bell) as Box<dyn Doorbell>)
    }
}

/// Factory-programmed MAC, as hex.
pub fn chip_id() -> String {
    let mut mac = [0u8; 6];
    unsafe {
        sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn sdk_version() -> String {
    unsafe { CStr::from_ptr(sys::esp_get_idf_version()) }
        .to_string_lossy()
        .into_owned()
}

struct EspOutputLine {
    pin: PinId,
}

impl OutputLine for EspOutputLine {
    fn set_level(&mut self, level: Level) {
        unsafe {
            sys::gpio_set_direction(self.pin, sys::gpio_mode_t_GPIO_MODE_OUTPUT);
            sys::gpio_set_level(self.pin, u32::from(level.is_high()));
        }
    }
}

/// An input line attached to its pin's [`EdgeHub`]. The pin's ISR handler
/// belongs to the hub, not to the line.
struct EspInputLine {
    pin: PinId,
    edges: Arc<EdgeRegistry>,
    edge: EdgeHandle,
}

// The registry keeps the hub alive until its handler has been removed.
unsafe extern "C" fn on_gpio_edge(arg: *mut c_void) {
    let hub = &*(arg as *const EdgeHub);
    hub.dispatch();
}

impl EspInputLine {
    fn new(pin: PinId, edges: Arc<EdgeRegistry>) -> Result<Self> {
        let edge = edges.attach(pin, |hub| unsafe {
            sys::gpio_intr_disable(pin);
            sys::gpio_set_intr_type(pin, sys::gpio_int_type_t_GPIO_INTR_ANYEDGE);
            sys::esp!(sys::gpio_isr_handler_add(
                pin,
                Some(on_gpio_edge),
                Arc::as_ptr(hub) as *mut c_void,
            ))
            .map_err(|err| platform_err("gpio_isr_handler_add", err))
        })?;
        Ok(Self { pin, edges, edge })
    }
}

impl InputLine for EspInputLine {
    fn configure(&mut self) {
        unsafe {
            sys::gpio_set_direction(self.pin, sys::gpio_mode_t_GPIO_MODE_INPUT);
            sys::gpio_set_pull_mode(self.pin, sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY);
        }
    }

    fn level(&self) -> Level {
        Level::from(unsafe { sys::gpio_get_level(self.pin) } != 0)
    }

    fn set_edge_callback(&mut self, on_edge: EdgeCallback) {
        drop(self.edge.hub.set_callback(self.edge.id, on_edge));
    }

    fn enable_edges(&mut self) {
        self.edge.hub.set_enabled(self.edge.id, true);
        unsafe {
            sys::gpio_intr_enable(self.pin);
        }
    }

    /// Masks the pin only once no line on it wants edges.
    fn disable_edges(&mut self) {
        if !self.edge.hub.set_enabled(self.edge.id, false) {
            unsafe {
                sys::gpio_intr_disable(self.pin);
            }
        }
    }
}

impl Drop for EspInputLine {
    fn drop(&mut self) {
        self.disable_edges();
        self.edges.detach(&self.edge, |pin| unsafe {
            sys::gpio_intr_disable(pin);
            sys::gpio_isr_handler_remove(pin);
        });
    }
}

struct TimerShared {
    callback: Mutex<RefCell<Option<TimerCallback>>>,
}

/// `esp_timer` wrapper holding one timer per dispatch method: millisecond
/// pacing expires on the esp_timer task, microsecond pacing straight from
/// the timer interrupt (needs `CONFIG_ESP_TIMER_SUPPORTS_ISR_DISPATCH_METHOD`).
/// Both share one callback. The timer callback owns a strong reference for
/// the duration of each expiry, so dropping the wrapper from inside its own
/// callback is sound.
struct EspSeqTimer {
    on_task: sys::esp_timer_handle_t,
    on_isr: sys::esp_timer_handle_t,
    shared: *const TimerShared,
    _name: CString,
}

unsafe impl Send for EspSeqTimer {}
unsafe impl Sync for EspSeqTimer {}

unsafe extern "C" fn on_esp_timer(arg: *mut c_void) {
    let raw = arg as *const TimerShared;
    Arc::increment_strong_count(raw);
    let shared = Arc::from_raw(raw);
    let taken = critical_section::with(|cs| shared.callback.borrow_ref_mut(cs).take());
    if let Some(mut callback) = taken {
        callback();
        critical_section::with(|cs| {
            let mut current = shared.callback.borrow_ref_mut(cs);
            if current.is_none() {
                *current = Some(callback);
            }
        });
    }
}

fn create_esp_timer(
    name: &CString,
    shared: *const TimerShared,
    dispatch_method: sys::esp_timer_dispatch_t,
) -> Result<sys::esp_timer_handle_t> {
    let args = sys::esp_timer_create_args_t {
        callback: Some(on_esp_timer),
        arg: shared as *mut c_void,
        dispatch_method,
        name: name.as_ptr(),
        skip_unhandled_events: false,
    };
    let mut handle: sys::esp_timer_handle_t = ptr::null_mut();
    sys::esp!(unsafe { sys::esp_timer_create(&args, &mut handle) })
        .map_err(|err| platform_err("esp_timer_create", err))?;
    Ok(handle)
}

impl EspSeqTimer {
    fn new(name: &'static str) -> Result<Self> {
        let name = CString::new(name).map_err(|err| DioError::Platform(err.to_string()))?;
        let shared = Arc::into_raw(Arc::new(TimerShared {
            callback: Mutex::new(RefCell::new(None)),
        }));
        let on_task = match create_esp_timer(&name, shared, sys::esp_timer_dispatch_t_ESP_TIMER_TASK) {
            Ok(handle) => handle,
            Err(err) => {
                drop(unsafe { Arc::from_raw(shared) });
                return Err(err);
            }
        };
        let on_isr = match create_esp_timer(&name, shared, sys::esp_timer_dispatch_t_ESP_TIMER_ISR) {
            Ok(handle) => handle,
            Err(err) => {
                unsafe {
                    sys::esp_timer_delete(on_task);
                    drop(Arc::from_raw(shared));
                }
                return Err(err);
            }
        };
        Ok(Self {
            on_task,
            on_isr,
            shared,
            _name: name,
        })
    }

    fn handle(&self, unit: TimeUnit) -> sys::esp_timer_handle_t {
        if unit.interrupt_dispatch() {
            self.on_isr
        } else {
            self.on_task
        }
    }

    fn stop_both(&self) {
        unsafe {
            sys::esp_timer_stop(self.on_task);
            sys::esp_timer_stop(self.on_isr);
        }
    }
}

impl SeqTimer for EspSeqTimer {
    fn arm(&self, interval: u32, unit: TimeUnit, repeat: bool) {
        let period = unit.to_micros(interval);
        let handle = self.handle(unit);
        self.stop_both();
        unsafe {
            let err = if repeat {
                sys::esp_timer_start_periodic(handle, period.max(1))
            } else {
                sys::esp_timer_start_once(handle, period)
            };
            if err != sys::ESP_OK as sys::esp_err_t {
                warn!("esp_timer arm {interval}{unit} failed: {err}");
            }
        }
    }

    fn disarm(&self) {
        self.stop_both();
    }

    fn set_callback(&self, callback: TimerCallback) {
        let shared = unsafe { &*self.shared };
        critical_section::with(|cs| *shared.callback.borrow_ref_mut(cs) = Some(callback));
    }
}

impl Drop for EspSeqTimer {
    fn drop(&mut self) {
        self.stop_both();
        unsafe {
            sys::esp_timer_delete(self.on_task);
            sys::esp_timer_delete(self.on_isr);
            drop(Arc::from_raw(self.shared));
        }
    }
}

/// Binary semaphore given from timer or interrupt context and taken by the
/// `dio_task` worker.
struct SemaphoreDoorbell {
    handle: sys::QueueHandle_t,
}

unsafe impl Send for SemaphoreDoorbell {}
unsafe impl Sync for SemaphoreDoorbell {}

impl SemaphoreDoorbell {
    fn new() -> Result<Self> {
        let handle = unsafe { sys::xQueueGenericCreate(1, 0, QUEUE_TYPE_BINARY_SEMAPHORE) };
        if handle.is_null() {
            return Err(DioError::OutOfMemory {
                requested: core::mem::size_of::<sys::StaticQueue_t>(),
            });
        }
        Ok(Self { handle })
    }
}

impl Doorbell for SemaphoreDoorbell {
    fn ring(&self) {
        unsafe {
            if esp_idf_hal::interrupt::active() {
                let mut woken: sys::BaseType_t = 0;
                sys::xQueueGiveFromISR(self.handle, &mut woken);
                if woken != 0 {
                    esp_idf_hal::task::do_yield();
                }
            } else {
                sys::xQueueGenericSend(self.handle, ptr::null(), 0, QUEUE_SEND_TO_BACK);
            }
        }
    }

    fn wait(&self) {
        unsafe {
            sys::xQueueSemaphoreTake(self.handle, BLOCK);
        }
    }
}

impl Drop for SemaphoreDoorbell {
    fn drop(&mut self) {
        unsafe { sys::vQueueDelete(self.handle) };
    }
}
