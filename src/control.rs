//! Control transfer stages and request handlers
//!
//! A control transfer is a SETUP stage, an optional DATA stage, and a
//! STATUS stage. The direction bit of the setup packet decides which
//! endpoint carries which stage:
//!
//! | Direction      | DATA completes on | STATUS completes on |
//! | -------------- | ----------------- | ------------------- |
//! | Device to host | IN                | OUT                 |
//! | Host to device | OUT               | IN                  |
//!
//! Each stage is handed to the [`RequestHandler`] registered for the
//! request's type (standard, class, vendor, or reserved). A missing handler,
//! or a handler that doesn't return [`RequestStatus::Ok`], stalls the
//! endpoint.

use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use usb_device::{
    control::{Recipient, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use crate::Device;

/// A control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The setup packet arrived
    Setup,
    /// A data packet moved in the request's direction
    Data,
    /// The zero-length handshake completed
    Status,
}

/// Result of handling a control stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The stage was handled
    Ok,
    /// The request is unsupported or invalid; stall the endpoint
    Stall,
}

/// A handler for one request type
///
/// Handlers run in the context of the completion interrupt. Use
/// [`Device::setup()`] to inspect the request, and the device's
/// scheduling methods to move data or acknowledge the request.
pub type RequestHandler<'a, H> = fn(&Device<'a, H>, EndpointAddress, Stage) -> RequestStatus;

/// The request handlers for a device, one per request type
///
/// ```
/// use usbd_queue::{Device, Hardware, RequestHandlers, RequestStatus, Stage};
/// use usb_device::endpoint::EndpointAddress;
///
/// fn vendor<H: Hardware>(device: &Device<H>, ep: EndpointAddress, stage: Stage) -> RequestStatus {
///     match (device.setup().request, stage) {
///         (0x42, Stage::Setup) => {
///             device.schedule_ack(ep);
///             RequestStatus::Ok
///         }
///         (0x42, _) => RequestStatus::Ok,
///         _ => RequestStatus::Stall,
///     }
/// }
///
/// # struct Board;
/// # impl Hardware for Board {
/// #     fn schedule_wait(&self, _: EndpointAddress, _: &usbd_queue::Td) {}
/// #     fn schedule_append(&self, _: EndpointAddress, _: &usbd_queue::Td, _: &usbd_queue::Td) {}
/// #     fn stall(&self, _: EndpointAddress) {}
/// #     fn transfer_error(&self, _: EndpointAddress, _: usbd_queue::Status) {}
/// #     fn mask_interrupt(&self) -> bool { false }
/// #     fn unmask_interrupt(&self) {}
/// # }
/// let handlers: RequestHandlers<'static, Board> = RequestHandlers::new().vendor(vendor);
/// assert!(handlers.handler(usb_device::control::RequestType::Vendor).is_some());
/// assert!(handlers.handler(usb_device::control::RequestType::Class).is_none());
/// ```
pub struct RequestHandlers<'a, H> {
    standard: Option<RequestHandler<'a, H>>,
    class: Option<RequestHandler<'a, H>>,
    vendor: Option<RequestHandler<'a, H>>,
    reserved: Option<RequestHandler<'a, H>>,
}

impl<'a, H> RequestHandlers<'a, H> {
    /// No handlers; every request stalls
    pub const fn new() -> Self {
        Self {
            standard: None,
            class: None,
            vendor: None,
            reserved: None,
        }
    }

    /// Handle standard requests with `handler`
    pub const fn standard(mut self, handler: RequestHandler<'a, H>) -> Self {
        self.standard = Some(handler);
        self
    }

    /// Handle class requests with `handler`
    pub const fn class(mut self, handler: RequestHandler<'a, H>) -> Self {
        self.class = Some(handler);
        self
    }

    /// Handle vendor requests with `handler`
    pub const fn vendor(mut self, handler: RequestHandler<'a, H>) -> Self {
        self.vendor = Some(handler);
        self
    }

    /// Handle reserved requests with `handler`
    pub const fn reserved(mut self, handler: RequestHandler<'a, H>) -> Self {
        self.reserved = Some(handler);
        self
    }

    /// Returns the handler registered for `request_type`
    pub fn handler(&self, request_type: RequestType) -> Option<RequestHandler<'a, H>> {
        match request_type {
            RequestType::Standard => self.standard,
            RequestType::Class => self.class,
            RequestType::Vendor => self.vendor,
            RequestType::Reserved => self.reserved,
        }
    }
}

impl<H> Default for RequestHandlers<'_, H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    /// Decode the eight bytes of a setup packet, as they appear on the wire
    pub const fn from_bytes(buf: [u8; 8]) -> Self {
        Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    /// Returns the request type, bits 5 and 6 of `bmRequestType`
    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Returns the data stage direction, bit 7 of `bmRequestType`
    ///
    /// `In` is device to host.
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Returns the request recipient, bits 0 through 4 of `bmRequestType`
    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Encode the setup packet as it appears on the wire
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

impl From<[u8; 8]> for SetupPacket {
    fn from(buf: [u8; 8]) -> Self {
        Self::from_bytes(buf)
    }
}

/// The controller exposes the setup buffer as a little-endian `u64`.
impl From<u64> for SetupPacket {
    fn from(setup: u64) -> Self {
        Self::from_bytes(setup.to_le_bytes())
    }
}

/// Tracks the control transaction in progress
///
/// The setup packet is written by the completion interrupt, and may be read
/// by the foreground. It's stored as two words behind a sequence count, so a
/// reader that's preempted by a new setup packet retries instead of seeing a
/// mix of both packets. There's only one writer, so the count doesn't need
/// read-modify-write atomics.
pub(crate) struct ControlState {
    /// Odd while the packet is being written
    sequence: AtomicU32,
    /// Setup bytes 0 through 3
    low: AtomicU32,
    /// Setup bytes 4 through 7
    high: AtomicU32,
    /// Set when the transaction was stalled. Cleared by the next setup.
    stalled: AtomicBool,
}

impl ControlState {
    pub(crate) const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            low: AtomicU32::new(0),
            high: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    /// Start a new transaction
    ///
    /// Only call this from the completion interrupt.
    pub(crate) fn begin(&self, setup: &SetupPacket) {
        let bytes = setup.to_bytes();
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.low.store(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Ordering::Relaxed,
        );
        self.high.store(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            Ordering::Relaxed,
        );
        self.sequence.store(sequence.wrapping_add(2), Ordering::Release);
        self.stalled.store(false, Ordering::Release);
    }

    pub(crate) fn setup(&self) -> SetupPacket {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            let low = self.low.load(Ordering::Relaxed).to_le_bytes();
            let high = self.high.load(Ordering::Relaxed).to_le_bytes();
            fence(Ordering::Acquire);
            let after = self.sequence.load(Ordering::Relaxed);
            if before == after && before % 2 == 0 {
                return SetupPacket::from_bytes([
                    low[0], low[1], low[2], low[3], high[0], high[1], high[2], high[3],
                ]);
            }
            core::hint::spin_loop();
        }
    }

    pub(crate) fn stall(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Returns the stage that an OUT completion represents
    pub(crate) fn out_stage(&self) -> Stage {
        match self.setup().direction() {
            UsbDirection::In => Stage::Status,
            UsbDirection::Out => Stage::Data,
        }
    }

    /// Returns the stage that an IN completion represents
    pub(crate) fn in_stage(&self) -> Stage {
        match self.setup().direction() {
            UsbDirection::In => Stage::Data,
            UsbDirection::Out => Stage::Status,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{ControlState, SetupPacket, Stage};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };
    use usb_device::{
        control::{Recipient, RequestType},
        UsbDirection,
    };

    /// GET_DESCRIPTOR(device), 18 bytes
    const GET_DESCRIPTOR: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];

    #[test]
    fn decode() {
        let setup = SetupPacket::from(GET_DESCRIPTOR);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 6);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
        assert_eq!(setup.kind(), RequestType::Standard);
        assert_eq!(setup.direction(), UsbDirection::In);
        assert_eq!(setup.recipient(), Recipient::Device);

        assert_eq!(SetupPacket::from(u64::from_le_bytes(GET_DESCRIPTOR)), setup);
    }

    #[test]
    fn request_types() {
        let kind = |request_type| {
            SetupPacket {
                request_type,
                ..Default::default()
            }
            .kind()
        };
        assert_eq!(kind(0x00), RequestType::Standard);
        assert_eq!(kind(0x21), RequestType::Class);
        assert_eq!(kind(0xC0), RequestType::Vendor);
        assert_eq!(kind(0x60), RequestType::Reserved);
    }

    #[test]
    fn recipients() {
        let recipient = |request_type| {
            SetupPacket {
                request_type,
                ..Default::default()
            }
            .recipient()
        };
        assert_eq!(recipient(0x01), Recipient::Interface);
        assert_eq!(recipient(0x82), Recipient::Endpoint);
        assert_eq!(recipient(0x03), Recipient::Other);
        assert_eq!(recipient(0x1F), Recipient::Reserved);
    }

    #[test]
    fn stages_follow_direction() {
        let state = ControlState::new();

        state.begin(&SetupPacket::from(GET_DESCRIPTOR));
        assert_eq!(state.in_stage(), Stage::Data);
        assert_eq!(state.out_stage(), Stage::Status);

        // SET_CONFIGURATION
        state.begin(&SetupPacket::from([0x00, 0x09, 0x01, 0, 0, 0, 0, 0]));
        assert_eq!(state.out_stage(), Stage::Data);
        assert_eq!(state.in_stage(), Stage::Status);
    }

    #[test]
    fn wire_format() {
        let setup = SetupPacket::from(GET_DESCRIPTOR);
        assert_eq!(setup.to_bytes(), GET_DESCRIPTOR);
    }

    #[test]
    fn setup_never_torn() {
        // Differs from GET_DESCRIPTOR in every byte.
        const VENDOR: [u8; 8] = [0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48];
        let first = SetupPacket::from(GET_DESCRIPTOR);
        let second = SetupPacket::from(VENDOR);
        let state = ControlState::new();
        state.begin(&first);
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..20_000 {
                    state.begin(if round % 2 == 0 { &second } else { &first });
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                let setup = state.setup();
                assert!(setup == first || setup == second, "{setup:?}");
            }
        });
    }

    #[test]
    fn setup_clears_stall() {
        let state = ControlState::new();
        state.stall();
        assert!(state.is_stalled());
        state.begin(&SetupPacket::from(GET_DESCRIPTOR));
        assert!(!state.is_stalled());
        assert_eq!(state.setup(), SetupPacket::from(GET_DESCRIPTOR));
    }
}
