//! Asynchronous transfers
//!
//! A [`Transfer`] is allocated once with a fixed number of isochronous packet
//! slots, filled for a handle and endpoint, submitted, completed through the
//! context's event loop and then reused or freed.
//!
//! While a transfer is submitted its buffer is owned by the backend and the
//! event loop holds a strong reference to it, so dropping every caller-side
//! clone does not end the transfer early.
//!
//! # Example
//!
//! ```no_run
//! use host::{Context, Payload, Transfer};
//! use std::time::Duration;
//!
//! let context = Context::init()?;
//! let handle = context.open_device_with_vid_pid(0x1234, 0x5678)?;
//!
//! let transfer = Transfer::new(0);
//! transfer.fill_bulk_transfer(&handle, 0x81, Payload::Length(64))?;
//! transfer.submit(
//!     |transfer, status, actual_length| {
//!         println!("{} after {} bytes: {:?}", status, actual_length, transfer.get_data());
//!     },
//!     Duration::from_millis(500),
//! )?;
//! context.handle_events()?;
//! # Ok::<(), host::Error>(())
//! ```

use crate::backend::{Completion, SubmitRequest, TransferId};
use crate::error::{Error, Result};
use crate::handle::DeviceHandle;
use crate::lock;
use protocol::{
    CONTROL_SETUP_SIZE, ControlSetup, IsoPacketDescriptor, TransferStatus, TransferType,
    UsbError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Data for a fill operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Literal bytes (sent for OUT, used as initial content for IN)
    Bytes(&'a [u8]),
    /// A zero-filled buffer of this many bytes
    Length(usize),
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(data) => data.len(),
            Payload::Length(length) => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn source(&self) -> PayloadSource {
        match self {
            Payload::Bytes(_) => PayloadSource::Bytes,
            Payload::Length(_) => PayloadSource::Length,
        }
    }

    /// Write into `buf`, zero-filling for [`Payload::Length`]
    fn write_to(&self, buf: &mut [u8]) {
        match self {
            Payload::Bytes(data) => buf[..data.len()].copy_from_slice(data),
            Payload::Length(_) => buf.fill(0),
        }
    }
}

/// Kind of payload the buffer was last filled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadSource {
    Bytes,
    Length,
}

/// Setup fields of a control transfer; wLength comes from the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
        }
    }

    fn with_length(&self, length: u16) -> ControlSetup {
        ControlSetup::new(
            self.request_type,
            self.request,
            self.value,
            self.index,
            length,
        )
    }
}

impl From<ControlSetup> for ControlRequest {
    fn from(setup: ControlSetup) -> Self {
        Self::new(setup.request_type, setup.request, setup.value, setup.index)
    }
}

/// What [`Transfer::submit_channel`] delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub actual_length: usize,
}

struct TransferState {
    freed: bool,
    kind: TransferType,
    handle: Option<DeviceHandle>,
    endpoint: u8,
    /// `None` before the first fill and while submitted
    buffer: Option<Vec<u8>>,
    /// Bytes of the buffer taking part in the transfer
    length: usize,
    actual_length: usize,
    status: TransferStatus,
    timeout: Duration,
    /// Allocated once; the length never changes
    iso_packets: Vec<IsoPacketDescriptor>,
    /// Packets in use, at most `iso_packets.len()`
    num_iso_packets: usize,
    submitted: bool,
    /// Bumped on every buffer allocation
    buffer_generation: u64,
    source: Option<PayloadSource>,
}

impl TransferState {
    fn check_idle(&self) -> Result<()> {
        if self.freed {
            Err(Error::InvalidTransfer)
        } else if self.submitted {
            Err(Error::AlreadySubmitted)
        } else {
            Ok(())
        }
    }

    /// Make the buffer exactly `size` bytes
    ///
    /// The buffer is kept if it already has that size and `source` is either
    /// `None` (the current payload stays) or the source of the last fill.
    fn ensure_buffer(&mut self, size: usize, source: Option<PayloadSource>) -> &mut Vec<u8> {
        let same_source = source.is_none() || source == self.source;
        let reuse = same_source && self.buffer.as_ref().is_some_and(|buf| buf.len() == size);
        if !reuse {
            self.buffer = Some(vec![0u8; size]);
            self.buffer_generation += 1;
        }
        if source.is_some() {
            self.source = source;
        }
        self.buffer.get_or_insert_with(Vec::new)
    }

    fn fill_data(&mut self, kind: TransferType, endpoint: u8, payload: Payload<'_>) {
        // A zero-length transfer still needs a buffer to count as filled
        let buffer = self.ensure_buffer(payload.len().max(1), Some(payload.source()));
        payload.write_to(buffer);
        self.kind = kind;
        self.endpoint = endpoint;
        self.length = payload.len();
        self.actual_length = 0;
    }

    fn fill_control_setup(
        &mut self,
        request: ControlRequest,
        payload: Option<Payload<'_>>,
    ) -> Result<()> {
        let data_length = match payload {
            Some(payload) => payload.len(),
            None => self
                .buffer
                .as_ref()
                .map_or(0, |buf| buf.len().saturating_sub(CONTROL_SETUP_SIZE)),
        };
        let w_length = u16::try_from(data_length).map_err(|_| UsbError::InvalidParam)?;

        let buffer = self.ensure_buffer(
            CONTROL_SETUP_SIZE + data_length,
            payload.as_ref().map(Payload::source),
        );
        request.with_length(w_length).write_to(buffer);
        if let Some(payload) = payload {
            payload.write_to(&mut buffer[CONTROL_SETUP_SIZE..]);
        }

        self.kind = TransferType::Control;
        self.endpoint = 0;
        self.length = CONTROL_SETUP_SIZE + data_length;
        self.actual_length = 0;
        Ok(())
    }

    fn setup(&self) -> Option<ControlSetup> {
        self.buffer
            .as_deref()
            .and_then(|buf| ControlSetup::decode(buf).ok())
    }

    /// Byte range of isochronous packet `index` within the buffer
    fn iso_packet_range(&self, index: usize) -> Result<(usize, &IsoPacketDescriptor)> {
        if index >= self.num_iso_packets {
            return Err(Error::InvalidPacket {
                index,
                count: self.num_iso_packets,
            });
        }
        let offset = self.iso_packets[..index]
            .iter()
            .map(|p| p.length as usize)
            .sum();
        Ok((offset, &self.iso_packets[index]))
    }
}

struct TransferInner {
    id: TransferId,
    state: Mutex<TransferState>,
}

/// One asynchronous USB request and its buffer
///
/// Cloning yields another reference to the same transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl Transfer {
    /// Allocate a transfer with `iso_packets` isochronous packet slots
    ///
    /// Use 0 for control, bulk and interrupt transfers.
    pub fn new(iso_packets: usize) -> Self {
        let id = TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(TransferInner {
                id,
                state: Mutex::new(TransferState {
                    freed: false,
                    kind: TransferType::Bulk,
                    handle: None,
                    endpoint: 0,
                    buffer: None,
                    length: 0,
                    actual_length: 0,
                    status: TransferStatus::Completed,
                    timeout: Duration::ZERO,
                    iso_packets: vec![IsoPacketDescriptor::default(); iso_packets],
                    num_iso_packets: 0,
                    submitted: false,
                    buffer_generation: 0,
                    source: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransferState> {
        lock(&self.inner.state)
    }

    pub fn id(&self) -> TransferId {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &Transfer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Write the setup packet, keeping the current payload if `payload` is `None`
    ///
    /// The buffer is reused when the payload length does not change.
    pub fn fill_control_setup(
        &self,
        request: ControlRequest,
        payload: Option<Payload<'_>>,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;
        state.fill_control_setup(request, payload)
    }

    /// Target `handle`'s default control endpoint
    ///
    /// Without `request` the setup packet already in the buffer is kept.
    pub fn fill_control_transfer(
        &self,
        handle: &DeviceHandle,
        request: Option<ControlRequest>,
        payload: Option<Payload<'_>>,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;

        let request = match request {
            Some(request) => request,
            None => ControlRequest::from(state.setup().ok_or(Error::NoBuffer)?),
        };
        state.fill_control_setup(request, payload)?;
        state.handle = Some(handle.clone());
        Ok(())
    }

    pub fn fill_bulk_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        payload: Payload<'_>,
    ) -> Result<()> {
        self.fill(handle, TransferType::Bulk, endpoint, payload)
    }

    pub fn fill_interrupt_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        payload: Payload<'_>,
    ) -> Result<()> {
        self.fill(handle, TransferType::Interrupt, endpoint, payload)
    }

    /// Fill an isochronous transfer using the first `num_packets` packet slots
    ///
    /// Packet lengths are set separately with
    /// [`Transfer::set_iso_packet_lengths`].
    pub fn fill_iso_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        payload: Payload<'_>,
        num_packets: usize,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;
        if num_packets > state.iso_packets.len() {
            return Err(Error::InvalidPacket {
                index: num_packets,
                count: state.iso_packets.len(),
            });
        }
        state.fill_data(TransferType::Isochronous, endpoint, payload);
        state.num_iso_packets = num_packets;
        state.handle = Some(handle.clone());
        Ok(())
    }

    fn fill(
        &self,
        handle: &DeviceHandle,
        kind: TransferType,
        endpoint: u8,
        payload: Payload<'_>,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;
        state.fill_data(kind, endpoint, payload);
        state.handle = Some(handle.clone());
        Ok(())
    }

    /// Give every allocated packet the same requested length
    pub fn set_iso_packet_lengths(&self, length: u32) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;
        for packet in &mut state.iso_packets {
            packet.length = length;
        }
        Ok(())
    }

    /// Set requested packet lengths in order; extra entries are ignored
    ///
    /// Every packet given a new length starts over with no received bytes.
    pub fn set_iso_packet_lengths_from(&self, lengths: &[u32]) -> Result<()> {
        let mut state = self.state();
        state.check_idle()?;
        for (packet, &length) in state.iso_packets.iter_mut().zip(lengths) {
            packet.length = length;
            packet.actual_length = 0;
        }
        Ok(())
    }

    /// Received bytes of packet `index` and its status
    ///
    /// `None` if the transfer has no buffer yet.
    pub fn get_iso_packet_buffer(&self, index: usize) -> Result<Option<(Vec<u8>, TransferStatus)>> {
        let state = self.state();
        state.check_idle()?;
        let (offset, packet) = state.iso_packet_range(index)?;
        let Some(buffer) = state.buffer.as_deref() else {
            return Ok(None);
        };
        let extent = state.length.min(buffer.len());
        let start = offset.min(extent);
        let end = (offset + packet.actual_length as usize).min(extent);
        Ok(Some((buffer[start..end].to_vec(), packet.status)))
    }

    /// Copy `data` into packet `index`, at most its declared length
    ///
    /// A declared length reaching past the end of the transfer is cut down
    /// to what is left. Returns the number of bytes copied, which also
    /// becomes the packet's actual length.
    pub fn set_iso_packet_buffer(&self, index: usize, data: &[u8]) -> Result<usize> {
        let mut state = self.state();
        state.check_idle()?;
        let (offset, packet) = state.iso_packet_range(index)?;
        let declared = packet.length as usize;
        let length = state.length;
        let buffer = state.buffer.as_mut().ok_or(Error::NoBuffer)?;

        let room = length.min(buffer.len()).saturating_sub(offset);
        let slot = declared.min(room);
        let copied = slot.min(data.len());
        if copied > 0 {
            buffer[offset..offset + copied].copy_from_slice(&data[..copied]);
        }

        let packet = &mut state.iso_packets[index];
        if declared > room {
            packet.length = room as u32;
        }
        packet.actual_length = copied as u32;
        Ok(copied)
    }

    /// The first `actual_length` bytes of the buffer
    ///
    /// For control transfers this starts with the setup packet; see
    /// [`Transfer::control_transfer_get_data`]. `None` if never filled.
    pub fn get_data(&self) -> Result<Option<Vec<u8>>> {
        let state = self.state();
        state.check_idle()?;
        Ok(state.buffer.as_deref().map(|buffer| {
            let end = state.actual_length.min(buffer.len());
            buffer[..end].to_vec()
        }))
    }

    /// Received data stage of a control transfer
    pub fn control_transfer_get_data(&self) -> Result<Option<Vec<u8>>> {
        let state = self.state();
        state.check_idle()?;
        Ok(state.buffer.as_deref().map(|buffer| {
            let start = CONTROL_SETUP_SIZE.min(buffer.len());
            let end = (CONTROL_SETUP_SIZE + state.actual_length).min(buffer.len());
            buffer[start..end].to_vec()
        }))
    }

    /// Decoded setup packet at the front of the buffer
    pub fn control_transfer_get_setup(&self) -> Result<Option<ControlSetup>> {
        let state = self.state();
        state.check_idle()?;
        Ok(state.setup())
    }

    /// Hand the transfer to the backend
    ///
    /// `callback` runs exactly once on the thread handling events, with the
    /// final status and actual length. A zero `timeout` means no timeout.
    pub fn submit<F>(&self, callback: F, timeout: Duration) -> Result<()>
    where
        F: FnOnce(&Transfer, TransferStatus, usize) + Send + 'static,
    {
        let (handle, request) = {
            let mut state = self.state();
            state.check_idle()?;
            let handle = state.handle.clone().ok_or(UsbError::InvalidParam)?;
            if state.buffer.is_none() {
                return Err(Error::NoBuffer);
            }
            let raw = handle.raw()?;

            let iso_packet_lengths = state.iso_packets[..state.num_iso_packets]
                .iter()
                .map(|p| p.length)
                .collect();
            for packet in &mut state.iso_packets {
                packet.actual_length = 0;
            }

            let request = SubmitRequest {
                id: self.inner.id,
                handle: raw,
                kind: state.kind,
                endpoint: state.endpoint,
                buffer: state.buffer.take().unwrap_or_default(),
                length: state.length,
                iso_packet_lengths,
                timeout,
            };
            state.submitted = true;
            state.timeout = timeout;
            state.actual_length = 0;
            (handle, request)
        };

        let context = match handle.context_inner() {
            Ok(context) => context,
            Err(e) => {
                self.restore(request.buffer);
                return Err(e);
            }
        };

        debug!(
            "Submitting {:?} transfer {} to endpoint {:#04x} ({} bytes)",
            request.kind, request.id, request.endpoint, request.length
        );

        // Registered first: a backend may complete synchronously
        context
            .events
            .register(self.inner.id, self.clone(), Box::new(callback), timeout);

        if let Err(rejected) = context.backend.submit(request, context.events.sink()) {
            context.events.unregister(self.inner.id);
            self.restore(rejected.buffer);
            debug!("Transfer {} rejected: {}", self.inner.id, rejected.error);
            return Err(Error::Usb(rejected.error));
        }
        Ok(())
    }

    /// Submit and deliver the outcome through a channel
    pub fn submit_channel(
        &self,
        timeout: Duration,
    ) -> Result<async_channel::Receiver<TransferOutcome>> {
        let (tx, rx) = async_channel::bounded(1);
        self.submit(
            move |_, status, actual_length| {
                let _ = tx.try_send(TransferOutcome {
                    status,
                    actual_length,
                });
            },
            timeout,
        )?;
        Ok(rx)
    }

    /// Ask for the transfer to be cancelled
    ///
    /// The callback still runs later, normally with
    /// [`TransferStatus::Cancelled`].
    pub fn cancel(&self) -> Result<()> {
        let handle = {
            let state = self.state();
            if state.freed {
                return Err(Error::InvalidTransfer);
            }
            if !state.submitted {
                return Err(Error::NotSubmitted);
            }
            state.handle.clone().ok_or(Error::NotSubmitted)?
        };
        let context = handle.context_inner()?;
        debug!("Cancelling transfer {}", self.inner.id);
        context.backend.cancel(self.inner.id).map_err(Error::Usb)
    }

    /// Release the buffer and handle; later use fails with `InvalidTransfer`
    pub fn free(&self) -> Result<()> {
        let mut state = self.state();
        if state.freed {
            return Ok(());
        }
        if state.submitted {
            return Err(Error::AlreadySubmitted);
        }
        state.freed = true;
        state.buffer = None;
        state.handle = None;
        Ok(())
    }

    fn restore(&self, buffer: Vec<u8>) {
        let mut state = self.state();
        state.buffer = Some(buffer);
        state.submitted = false;
    }

    /// Write a backend result back into the transfer
    pub(crate) fn complete(&self, status: TransferStatus, completion: Completion) {
        let mut state = self.state();
        state.buffer = Some(completion.buffer);
        state.status = status;
        state.actual_length = completion.actual_length;
        for (slot, result) in state.iso_packets.iter_mut().zip(completion.iso_packets) {
            slot.actual_length = result.actual_length;
            slot.status = result.status;
        }
        state.submitted = false;
    }

    /// The backend went away with this transfer outstanding
    pub(crate) fn abandon(&self) {
        let mut state = self.state();
        state.status = TransferStatus::Cancelled;
        state.submitted = false;
    }

    pub fn status(&self) -> TransferStatus {
        self.state().status
    }

    pub fn actual_length(&self) -> usize {
        self.state().actual_length
    }

    /// Bytes taking part in the transfer, setup packet included
    pub fn length(&self) -> usize {
        self.state().length
    }

    pub fn endpoint(&self) -> u8 {
        self.state().endpoint
    }

    pub fn transfer_type(&self) -> TransferType {
        self.state().kind
    }

    pub fn timeout(&self) -> Duration {
        self.state().timeout
    }

    pub fn handle(&self) -> Option<DeviceHandle> {
        self.state().handle.clone()
    }

    pub fn is_submitted(&self) -> bool {
        self.state().submitted
    }

    pub fn is_freed(&self) -> bool {
        self.state().freed
    }

    /// Packet slots fixed at allocation
    pub fn iso_packet_capacity(&self) -> usize {
        self.state().iso_packets.len()
    }

    pub fn num_iso_packets(&self) -> usize {
        self.state().num_iso_packets
    }

    pub fn iso_packets(&self) -> Vec<IsoPacketDescriptor> {
        let state = self.state();
        state.iso_packets[..state.num_iso_packets].to_vec()
    }

    /// Changes whenever a fill had to allocate a new buffer
    pub fn buffer_generation(&self) -> u64 {
        self.state().buffer_generation
    }

    /// Address of the current buffer, for identity checks
    pub fn buffer_ptr(&self) -> Option<*const u8> {
        self.state().buffer.as_ref().map(|buf| buf.as_ptr())
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("kind", &state.kind)
            .field("endpoint", &state.endpoint)
            .field("length", &state.length)
            .field("status", &state.status)
            .field("submitted", &state.submitted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_descriptor() -> ControlRequest {
        ControlRequest::new(0x80, 0x06, 0x0100, 0)
    }

    #[test]
    fn test_new_transfer_has_no_data() {
        let transfer = Transfer::new(0);
        assert_eq!(transfer.get_data().unwrap(), None);
        assert_eq!(transfer.control_transfer_get_setup().unwrap(), None);
        assert!(!transfer.is_submitted());
    }

    #[test]
    fn test_control_setup_layout() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(18)))
            .unwrap();
        assert_eq!(transfer.length(), 8 + 18);
        assert_eq!(transfer.transfer_type(), TransferType::Control);
        let setup = transfer.control_transfer_get_setup().unwrap().unwrap();
        assert_eq!(setup, ControlSetup::new(0x80, 0x06, 0x0100, 0, 18));
    }

    #[test]
    fn test_same_length_reuses_buffer() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(b"abcd")))
            .unwrap();
        let generation = transfer.buffer_generation();
        let ptr = transfer.buffer_ptr();

        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(b"wxyz")))
            .unwrap();
        assert_eq!(transfer.buffer_generation(), generation);
        assert_eq!(transfer.buffer_ptr(), ptr);

        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(b"abcde")))
            .unwrap();
        assert_ne!(transfer.buffer_generation(), generation);
    }

    #[test]
    fn test_switching_payload_source_reallocates() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(b"abcd")))
            .unwrap();
        let generation = transfer.buffer_generation();

        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(4)))
            .unwrap();
        let after_length = transfer.buffer_generation();
        assert_ne!(after_length, generation);

        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(4)))
            .unwrap();
        assert_eq!(transfer.buffer_generation(), after_length);

        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(b"abcd")))
            .unwrap();
        assert_ne!(transfer.buffer_generation(), after_length);
    }

    #[test]
    fn test_setup_only_keeps_payload() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(
                ControlRequest::new(0x40, 0x01, 0, 0),
                Some(Payload::Bytes(b"xyz")),
            )
            .unwrap();
        let generation = transfer.buffer_generation();

        transfer
            .fill_control_setup(ControlRequest::new(0x40, 0x02, 7, 1), None)
            .unwrap();
        assert_eq!(transfer.buffer_generation(), generation);
        let setup = transfer.control_transfer_get_setup().unwrap().unwrap();
        assert_eq!(setup.request, 0x02);
        assert_eq!(setup.length, 3);
    }

    #[test]
    fn test_control_payload_too_long() {
        let transfer = Transfer::new(0);
        let err = transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(70_000)))
            .unwrap_err();
        assert_eq!(err, Error::Usb(UsbError::InvalidParam));
    }

    #[test]
    fn test_length_payload_zeroes_buffer() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Bytes(&[0xff; 4])))
            .unwrap();
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(4)))
            .unwrap();
        let mut state = transfer.state();
        state.actual_length = 4;
        drop(state);
        assert_eq!(transfer.control_transfer_get_data().unwrap().unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_iso_packets_fixed_at_allocation() {
        let transfer = Transfer::new(3);
        assert_eq!(transfer.iso_packet_capacity(), 3);
        transfer.set_iso_packet_lengths_from(&[1, 2, 3, 4, 5]).unwrap();
        let state = transfer.state();
        assert_eq!(state.iso_packets.len(), 3);
        assert_eq!(state.iso_packets[2].length, 3);
    }

    #[test]
    fn test_iso_packet_buffer_clamped_to_transfer() {
        let transfer = Transfer::new(2);
        {
            let mut state = transfer.state();
            state.buffer = Some(vec![0; 6]);
            state.length = 6;
            state.num_iso_packets = 2;
        }
        transfer.set_iso_packet_lengths(4).unwrap();

        assert_eq!(transfer.set_iso_packet_buffer(1, &[9; 4]).unwrap(), 2);
        let packets = transfer.iso_packets();
        assert_eq!(packets[1].length, 2);
        assert_eq!(packets[1].actual_length, 2);
        assert_eq!(packets[0].length, 4);
    }

    #[test]
    fn test_iso_packet_index_out_of_range() {
        let transfer = Transfer::new(2);
        let err = transfer.get_iso_packet_buffer(0).unwrap_err();
        assert_eq!(err, Error::InvalidPacket { index: 0, count: 0 });
    }

    #[test]
    fn test_cancel_unsubmitted() {
        assert_eq!(Transfer::new(0).cancel().unwrap_err(), Error::NotSubmitted);
    }

    #[test]
    fn test_free_is_idempotent() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(1)))
            .unwrap();
        transfer.free().unwrap();
        transfer.free().unwrap();
        assert!(transfer.is_freed());
        assert_eq!(transfer.get_data().unwrap_err(), Error::InvalidTransfer);
        assert_eq!(
            transfer
                .fill_control_setup(get_descriptor(), None)
                .unwrap_err(),
            Error::InvalidTransfer
        );
    }

    #[test]
    fn test_submit_without_handle() {
        let transfer = Transfer::new(0);
        transfer
            .fill_control_setup(get_descriptor(), Some(Payload::Length(1)))
            .unwrap();
        let err = transfer.submit(|_, _, _| {}, Duration::ZERO).unwrap_err();
        assert_eq!(err, Error::Usb(UsbError::InvalidParam));
        assert!(!transfer.is_submitted());
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        assert_ne!(Transfer::new(0).id(), Transfer::new(0).id());
    }
}
