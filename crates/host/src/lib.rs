//! Host-side USB access
//!
//! The library is organised around four objects:
//!
//! - [`Context`]: one instance of the library, owning a [`Backend`], the
//!   device registry, the open handles and the event loop
//! - [`Device`]: an enumerated device, deduplicated per bus address
//! - [`DeviceHandle`]: an open session with configuration, interface and
//!   synchronous transfer operations
//! - [`Transfer`]: a reusable asynchronous request, completed by whichever
//!   thread handles events
//!
//! Completions are dispatched only from inside event handling
//! ([`Context::handle_events`] and friends, or an [`EventThread`]), never from
//! the thread of the OS stack.
//!
//! # Example
//!
//! ```no_run
//! use host::{Context, Payload};
//! use std::time::Duration;
//!
//! let context = Context::init()?;
//! let handle = context.open_device_with_vid_pid(0x1234, 0x5678)?;
//! handle.claim_interface(0)?;
//!
//! let sent = handle.bulk_transfer(0x02, Payload::Bytes(b"ping"), Duration::from_secs(1))?;
//! let reply = handle.bulk_transfer(0x81, Payload::Length(64), Duration::from_secs(1))?;
//! println!("sent {} bytes, received {:?}", sent.transferred.len(), reply.transferred);
//!
//! handle.release_interface(0)?;
//! handle.close();
//! context.exit();
//! # Ok::<(), host::Error>(())
//! ```

pub mod backend;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod handle;
mod registry;
pub mod transfer;

pub use backend::{
    Backend, DeviceKey, EndpointBehaviour, MockBackend, MockDevice, RawHandle, RusbBackend,
    TransferId,
};
pub use context::{
    Context, LogLevel, default_context, get_device_list, handle_events, handle_events_timeout,
    open_device_with_vid_pid, set_debug,
};
pub use device::Device;
pub use error::{Error, Result};
pub use events::{CompletionQueue, EventThread, EventWaiters, EventsLock};
pub use handle::{DeviceHandle, PartialTransfer, StringDescriptor, Transferred};
pub use transfer::{ControlRequest, Payload, Transfer, TransferOutcome};

pub use protocol::{
    ConfigDescriptor, ControlSetup, Descriptor, DeviceDescriptor, EndpointDescriptor, Interface,
    InterfaceDescriptor, IsoPacketDescriptor, TransferStatus, TransferType, UsbError,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning
///
/// Every critical section in this crate leaves its data consistent before any
/// call that can panic, so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
