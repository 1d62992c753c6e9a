//! Library contexts
//!
//! A [`Context`] owns one backend instance together with the device registry,
//! the table of open handles and the event loop. Contexts are cheap to clone;
//! all clones refer to the same instance.
//!
//! A process-wide default context is created on first use by the free
//! functions at the crate root and lives until the process exits.
//!
//! # Example
//!
//! ```no_run
//! use host::Context;
//!
//! let context = Context::init()?;
//! for device in context.get_device_list()? {
//!     let descriptor = device.device_descriptor()?;
//!     println!(
//!         "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
//!         device.bus_number(),
//!         device.device_address(),
//!         descriptor.vendor_id,
//!         descriptor.product_id
//!     );
//! }
//! context.exit();
//! # Ok::<(), host::Error>(())
//! ```

use crate::backend::{Backend, RawHandle, RusbBackend};
use crate::device::{Device, DeviceInner};
use crate::error::{Error, Result};
use crate::events::{EventLoop, EventWaiters, EventsLock};
use crate::handle::{DeviceHandle, HandleInner};
use crate::lock;
use crate::registry::Registry;
use common::LusbConfig;
use protocol::UsbError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

static DEFAULT_CONTEXT: Mutex<Option<Context>> = Mutex::new(None);

/// Diagnostic verbosity, numbered like libusb's debug levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    #[default]
    None = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    /// Levels above 4 are clamped
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => LogLevel::None,
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    pub fn as_level(self) -> u8 {
        self as u8
    }
}

pub(crate) struct ContextInner {
    id: u64,
    pub(crate) backend: Arc<dyn Backend>,
    valid: AtomicBool,
    default: bool,
    debug: AtomicU8,
    event_timeout: Duration,
    pub(crate) registry: Registry,
    handles: Mutex<HashMap<RawHandle, Weak<HandleInner>>>,
    pub(crate) events: EventLoop,
}

impl ContextInner {
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn event_timeout(&self) -> Duration {
        self.event_timeout
    }

    pub(crate) fn track_handle(&self, raw: RawHandle, handle: &Arc<HandleInner>) {
        lock(&self.handles).insert(raw, Arc::downgrade(handle));
    }

    pub(crate) fn forget_handle(&self, raw: RawHandle) {
        lock(&self.handles).remove(&raw);
    }

    fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidContext)
        }
    }

    /// Handle events unless `completed` is set, cooperating with any other
    /// thread that is already handling events
    pub(crate) fn handle_events_timeout_completed(
        &self,
        timeout: Duration,
        completed: Option<&AtomicBool>,
    ) -> Result<()> {
        let is_completed = || completed.is_some_and(|flag| flag.load(Ordering::Acquire));

        loop {
            self.check_valid()?;

            if let Some(guard) = self.events.try_lock() {
                if !is_completed() {
                    self.events.handle_locked(timeout);
                }
                guard.unlock();
                return Ok(());
            }

            let mut waiters = self.events.lock_waiters();
            if is_completed() {
                return Ok(());
            }
            if !self.events.handler_active() {
                // The handler finished between our attempts; try again
                continue;
            }
            waiters.wait_for_event(Some(timeout));
            return Ok(());
        }
    }

    /// Close every open handle and stop the backend
    fn teardown(&self) {
        let handles: Vec<Arc<HandleInner>> = lock(&self.handles)
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        if !handles.is_empty() {
            debug!("Closing {} handles of context {}", handles.len(), self.id);
        }
        for handle in &handles {
            handle.close(None);
        }
        drop(handles);

        let abandoned = self.events.abandon_all();
        if abandoned > 0 {
            warn!(
                "Context {} exited with {} transfers outstanding",
                self.id, abandoned
            );
        }
        self.events.interrupt();
        self.backend.shutdown();
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            self.teardown();
        }
    }
}

/// Root object of the library
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open the system USB stack with default settings
    pub fn init() -> Result<Self> {
        Self::with_config(&LusbConfig::default())
    }

    /// Open the system USB stack with `config`
    pub fn with_config(config: &LusbConfig) -> Result<Self> {
        let backend = RusbBackend::new(config.transfers.worker_threads)?;
        Ok(Self::with_backend_and_config(Arc::new(backend), config))
    }

    /// Use an explicit backend, for instance a [`crate::MockBackend`]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self::with_backend_and_config(backend, &LusbConfig::default())
    }

    pub fn with_backend_and_config(backend: Arc<dyn Backend>, config: &LusbConfig) -> Self {
        Self::create(backend, config, false)
    }

    fn create(backend: Arc<dyn Backend>, config: &LusbConfig, default: bool) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let level = LogLevel::from_level(config.context.debug_level);
        backend.set_debug(level);
        info!(
            "Created context {} on {} backend{}",
            id,
            backend.name(),
            if default { " (default)" } else { "" }
        );

        Self {
            inner: Arc::new(ContextInner {
                id,
                events: EventLoop::new(backend.clone()),
                backend,
                valid: AtomicBool::new(true),
                default,
                debug: AtomicU8::new(level.as_level()),
                event_timeout: config.context.event_timeout(),
                registry: Registry::new(),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn is_default(&self) -> bool {
        self.inner.default
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set diagnostic verbosity; values above 4 are clamped
    pub fn set_debug(&self, level: u8) -> Result<()> {
        self.inner.check_valid()?;
        let level = LogLevel::from_level(level);
        self.inner.debug.store(level.as_level(), Ordering::Relaxed);
        self.inner.backend.set_debug(level);
        if level >= LogLevel::Debug {
            debug!("Context {} debug level set to {:?}", self.inner.id, level);
        }
        Ok(())
    }

    pub fn debug_level(&self) -> LogLevel {
        LogLevel::from_level(self.inner.debug.load(Ordering::Relaxed))
    }

    /// Enumerate attached devices
    ///
    /// A device that is still referenced from an earlier call is returned as
    /// the same object.
    pub fn get_device_list(&self) -> Result<Vec<Device>> {
        self.inner.check_valid()?;
        let keys = self.inner.backend.enumerate().map_err(|e| {
            warn!("Device enumeration failed: {}", e);
            e
        })?;

        let devices: Vec<Device> = keys
            .into_iter()
            .map(|key| {
                self.inner
                    .registry
                    .resolve(key, || DeviceInner::new(key, &self.inner))
            })
            .collect();

        if self.debug_level() >= LogLevel::Debug {
            debug!(
                "Enumerated {} devices ({} tracked)",
                devices.len(),
                self.inner.registry.len()
            );
        }
        Ok(devices)
    }

    /// Open the first device with the given ids
    ///
    /// Enumeration, descriptor and open failures are returned as they are;
    /// finding no match is [`UsbError::NoDevice`].
    pub fn open_device_with_vid_pid(&self, vendor_id: u16, product_id: u16) -> Result<DeviceHandle> {
        for device in self.get_device_list()? {
            let descriptor = device.device_descriptor()?;
            if descriptor.vendor_id == vendor_id && descriptor.product_id == product_id {
                return device.open();
            }
        }
        Err(Error::Usb(UsbError::NoDevice))
    }

    /// Release the backend and close all handles
    ///
    /// Idempotent. Transfers must not be outstanding. On the default context
    /// this does nothing: it lives until the process exits.
    pub fn exit(&self) {
        if self.inner.default {
            info!("Ignoring exit of the default context");
            return;
        }
        if !self.inner.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Exiting context {}", self.inner.id);
        self.inner.teardown();
    }

    /// Become the active event handler if nobody else is
    pub fn try_lock_events(&self) -> Result<Option<EventsLock<'_>>> {
        self.inner.check_valid()?;
        Ok(self.inner.events.try_lock())
    }

    /// Become the active event handler, waiting for the current one
    pub fn lock_events(&self) -> Result<EventsLock<'_>> {
        self.inner.check_valid()?;
        Ok(self.inner.events.lock())
    }

    /// Take the event waiters lock
    ///
    /// Check your condition, then sleep with [`EventWaiters::wait_for_event`].
    pub fn lock_event_waiters(&self) -> Result<EventWaiters<'_>> {
        self.inner.check_valid()?;
        Ok(self.inner.events.lock_waiters())
    }

    /// Whether the active handler may keep handling events
    ///
    /// False while a handle is being closed.
    pub fn event_handling_ok(&self) -> bool {
        self.inner.is_valid() && self.inner.events.handling_ok()
    }

    pub fn event_handler_active(&self) -> bool {
        self.inner.events.handler_active()
    }

    /// Wake the active handler early
    pub fn interrupt_event_handler(&self) -> Result<()> {
        self.inner.check_valid()?;
        self.inner.events.interrupt();
        Ok(())
    }

    /// Handle events as the holder of `lock`
    pub fn handle_events_locked(&self, lock: &EventsLock<'_>, timeout: Duration) -> Result<()> {
        self.inner.check_valid()?;
        if !lock.belongs_to(&self.inner.events) {
            return Err(Error::Usb(UsbError::InvalidParam));
        }
        self.inner.events.handle_locked(timeout);
        Ok(())
    }

    /// Handle events for at most `timeout`
    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.handle_events_timeout_completed(timeout, None)
    }

    /// Like [`Context::handle_events_timeout`], returning early once
    /// `completed` is set
    pub fn handle_events_timeout_completed(
        &self,
        timeout: Duration,
        completed: &AtomicBool,
    ) -> Result<()> {
        self.inner
            .handle_events_timeout_completed(timeout, Some(completed))
    }

    /// Handle events with the configured default timeout
    pub fn handle_events(&self) -> Result<()> {
        self.handle_events_timeout(self.inner.event_timeout)
    }

    /// Time until the earliest transfer deadline, if any transfer has one
    pub fn get_next_timeout(&self) -> Result<Option<Duration>> {
        self.inner.check_valid()?;
        Ok(self.inner.events.next_timeout())
    }

    /// Transfer timeouts are always handled internally
    pub fn pollfds_handle_timeouts(&self) -> bool {
        true
    }

    /// Number of submitted transfers that have not completed yet
    pub fn pending_transfers(&self) -> usize {
        self.inner.events.in_flight_count()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name())
            .field("valid", &self.inner.is_valid())
            .field("default", &self.inner.default)
            .finish()
    }
}

/// The process-wide default context, created on first use
pub fn default_context() -> Result<Context> {
    let mut slot = lock(&DEFAULT_CONTEXT);
    if let Some(context) = slot.as_ref() {
        return Ok(context.clone());
    }
    let config = LusbConfig::default();
    let backend = RusbBackend::new(config.transfers.worker_threads)?;
    let context = Context::create(Arc::new(backend), &config, true);
    *slot = Some(context.clone());
    Ok(context)
}

/// [`Context::set_debug`] on the default context
pub fn set_debug(level: u8) -> Result<()> {
    default_context()?.set_debug(level)
}

/// [`Context::get_device_list`] on the default context
pub fn get_device_list() -> Result<Vec<Device>> {
    default_context()?.get_device_list()
}

/// [`Context::open_device_with_vid_pid`] on the default context
pub fn open_device_with_vid_pid(vendor_id: u16, product_id: u16) -> Result<DeviceHandle> {
    default_context()?.open_device_with_vid_pid(vendor_id, product_id)
}

/// [`Context::handle_events`] on the default context
pub fn handle_events() -> Result<()> {
    default_context()?.handle_events()
}

/// [`Context::handle_events_timeout`] on the default context
pub fn handle_events_timeout(timeout: Duration) -> Result<()> {
    default_context()?.handle_events_timeout(timeout)
}
