//! Transfer queues and control dispatch for one USB controller
//!
//! A `Device` is shared between the foreground, which schedules transfers,
//! and the USB interrupt handler, which reports completions. Everything takes
//! `&self`, so a `Device` can live in a `static`.

use usb_device::{endpoint::EndpointAddress, UsbError};

use crate::{
    control::{ControlState, RequestHandlers, RequestStatus, SetupPacket, Stage},
    hardware::Hardware,
    queue::{Callback, EndpointQueue, TransferPool},
    state::{QueueTable, MAX_ENDPOINTS},
};

/// Why [`Device::transferred_bytes()`] has nothing to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    /// The endpoint has no transfer queue
    Uninitialized,
    /// The endpoint has no active transfers
    Empty,
}

/// Transfer queues and control request dispatch for one USB controller
///
/// After you create a `Device` with [`new()`](Device::new), you must
///
/// - call [`queue_init()`](Device::queue_init) once for every endpoint that
///   will move data, before any traffic on that endpoint.
/// - call [`on_transfer_complete()`](Device::on_transfer_complete) from the USB
///   interrupt whenever a non-control endpoint may have finished a transfer.
/// - call [`on_setup_complete()`](Device::on_setup_complete),
///   [`on_control_out_complete()`](Device::on_control_out_complete), and
///   [`on_control_in_complete()`](Device::on_control_in_complete) for the
///   control endpoints.
///
/// Use one `Device` per USB controller.
///
/// ```
/// use usbd_queue::{
///     Device, Hardware, RequestHandlers, RequestStatus, Stage, Status, Td, TransferPool,
/// };
/// use usb_device::{endpoint::EndpointAddress, UsbDirection};
///
/// struct Board;
///
/// impl Hardware for Board {
///     fn schedule_wait(&self, endpoint: EndpointAddress, td: &Td) {
///         // Point the endpoint's queue head at td, and prime the endpoint...
/// #       let _ = (endpoint, td);
///     }
///     fn schedule_append(&self, endpoint: EndpointAddress, tail: &Td, td: &Td) {
///         tail.set_next(td);
///         // Run the add-TD tripwire...
/// #       let _ = endpoint;
///     }
///     fn stall(&self, endpoint: EndpointAddress) {
///         // Set the endpoint's stall bits...
/// #       let _ = endpoint;
///     }
///     fn transfer_error(&self, endpoint: EndpointAddress, status: Status) {
///         // Count the error, and clear the endpoint's halt...
/// #       let _ = (endpoint, status);
///     }
///     fn mask_interrupt(&self) -> bool {
///         // Mask the USB interrupt, returning true if it was unmasked...
/// #       false
///     }
///     fn unmask_interrupt(&self) {
///         // Unmask the USB interrupt...
///     }
/// }
///
/// fn standard(device: &Device<Board>, ep: EndpointAddress, stage: Stage) -> RequestStatus {
///     // Look at device.setup(), and schedule the data and status stages...
/// #   let _ = (device, ep, stage);
///     RequestStatus::Ok
/// }
///
/// static EP0_OUT: TransferPool<2> = TransferPool::new();
/// static EP0_IN: TransferPool<2> = TransferPool::new();
/// static DEVICE: Device<'static, Board> =
///     Device::new(Board, RequestHandlers::new().standard(standard));
///
/// DEVICE.queue_init(EndpointAddress::from_parts(0, UsbDirection::Out), &EP0_OUT);
/// DEVICE.queue_init(EndpointAddress::from_parts(0, UsbDirection::In), &EP0_IN);
/// ```
pub struct Device<'a, H> {
    hw: H,
    queues: QueueTable<'a>,
    handlers: RequestHandlers<'a, H>,
    control: ControlState,
}

impl<'a, H> Device<'a, H> {
    /// Create a device that uses `hw` to talk to the controller, and
    /// `handlers` to service control requests
    pub const fn new(hw: H, handlers: RequestHandlers<'a, H>) -> Self {
        Device {
            hw,
            queues: QueueTable::new(),
            handlers,
            control: ControlState::new(),
        }
    }

    /// Access the hardware collaborator
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Returns the setup packet of the control transaction in progress
    pub fn setup(&self) -> SetupPacket {
        self.control.setup()
    }
}

impl<'a, H: Hardware> Device<'a, H> {
    /// Bind `pool` to the endpoint `ep_addr`
    ///
    /// # Panics
    ///
    /// Panics if the endpoint already has a queue, if `pool` is already bound to
    /// an endpoint, or if the endpoint number isn't supported.
    pub fn queue_init<const N: usize>(&self, ep_addr: EndpointAddress, pool: &'a TransferPool<N>) {
        assert!(
            ep_addr.index() < MAX_ENDPOINTS / 2,
            "EP{} isn't supported",
            ep_addr.index()
        );
        let transfers = pool.take().unwrap_or_else(|| {
            panic!(
                "EP{} {:?} transfer pool already assigned",
                ep_addr.index(),
                ep_addr.direction()
            )
        });
        if self.queues.insert(ep_addr, transfers).is_none() {
            panic!(
                "EP{} {:?} queue already initialized",
                ep_addr.index(),
                ep_addr.direction()
            );
        }
        debug!("EP{} QUEUE {=usize}", ep_addr.index(), N);
    }

    /// Acquire the queue for `ep_addr`
    ///
    /// # Panics
    ///
    /// Panics if the endpoint has no queue.
    fn queue(&self, ep_addr: EndpointAddress) -> &EndpointQueue<'a> {
        self.queues.get(ep_addr).unwrap_or_else(|| {
            panic!(
                "EP{} {:?} has no transfer queue",
                ep_addr.index(),
                ep_addr.direction()
            )
        })
    }

    /// Schedule a transfer of up to `max_len` bytes on `ep_addr`
    ///
    /// The controller reads from `buffer` for IN endpoints, and writes into
    /// `buffer` for OUT endpoints. When the transfer leaves the queue,
    /// `callback` receives `user_data`, and the result.
    ///
    /// Returns `WouldBlock` if all of the endpoint's transfers are in use.
    /// Try again once a transfer completes.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `max_len` bytes, and must stay valid until
    /// the transfer completes, or until the endpoint is flushed. Nothing else may
    /// access the buffer while the controller owns it.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint has no queue, or if `max_len` exceeds
    /// [`MAX_TRANSFER_LEN`](crate::MAX_TRANSFER_LEN).
    pub unsafe fn schedule(
        &self,
        ep_addr: EndpointAddress,
        buffer: *mut u8,
        max_len: usize,
        callback: Option<Callback>,
        user_data: usize,
    ) -> Result<(), UsbError> {
        self.queue(ep_addr)
            .schedule(&self.hw, buffer, max_len, callback, user_data)
    }

    /// Schedule a transfer, waiting until a transfer is free
    ///
    /// Only use this when you know that the endpoint is draining. Between
    /// attempts, this calls [`Hardware::wait_for_transfer()`]. If you call
    /// this from the completion interrupt, make sure that `wait_for_transfer`
    /// reclaims the endpoint; otherwise, this never returns.
    ///
    /// # Safety
    ///
    /// See [`schedule()`](Device::schedule).
    pub unsafe fn schedule_block(
        &self,
        ep_addr: EndpointAddress,
        buffer: *mut u8,
        max_len: usize,
        callback: Option<Callback>,
        user_data: usize,
    ) {
        while let Err(UsbError::WouldBlock) =
            self.schedule(ep_addr, buffer, max_len, callback, user_data)
        {
            self.hw.wait_for_transfer(ep_addr);
        }
    }

    /// Schedule a zero-length transfer, like the status stage of a control
    /// transfer
    pub fn schedule_ack(&self, ep_addr: EndpointAddress) {
        // Safety: a zero-length transfer never touches the buffer.
        unsafe { self.schedule_block(ep_addr, core::ptr::null_mut(), 0, None, 0) }
    }

    /// Abort all transfers on `ep_addr`
    ///
    /// Callbacks observe [`Completion::Aborted`](crate::Completion::Aborted).
    /// Use this after the controller has flushed the endpoint, like after a
    /// bus reset. Returns the number of aborted transfers.
    pub fn flush(&self, ep_addr: EndpointAddress) -> usize {
        self.queue(ep_addr).flush(&self.hw)
    }

    /// Reclaim the transfers that the controller finished on `ep_addr`
    ///
    /// Call this from the USB interrupt when the endpoint signals completion.
    /// Callbacks run in the order that their transfers were scheduled.
    pub fn on_transfer_complete(&self, ep_addr: EndpointAddress) {
        self.queue(ep_addr).complete(&self.hw);
    }

    /// Indicates if `ep_addr` has any scheduled transfers
    ///
    /// Returns `false` if the endpoint has no queue.
    pub fn is_active(&self, ep_addr: EndpointAddress) -> bool {
        self.queues
            .get(ep_addr)
            .is_some_and(|queue| queue.is_active(&self.hw))
    }

    /// Returns the number of transfers that could be scheduled on `ep_addr`
    /// right now
    ///
    /// Returns zero if the endpoint has no queue.
    pub fn free_space(&self, ep_addr: EndpointAddress) -> usize {
        self.queues
            .get(ep_addr)
            .map_or(0, |queue| queue.free_space(&self.hw))
    }

    /// Returns the number of bytes moved so far by the oldest transfer on
    /// `ep_addr`
    pub fn transferred_bytes(&self, ep_addr: EndpointAddress) -> Result<usize, QueryError> {
        self.queues
            .get(ep_addr)
            .ok_or(QueryError::Uninitialized)?
            .transferred_bytes(&self.hw)
            .ok_or(QueryError::Empty)
    }

    /// Invoke the handler for the current request
    fn dispatch(&self, ep_addr: EndpointAddress, stage: Stage) {
        let setup = self.control.setup();
        let status = match self.handlers.handler(setup.kind()) {
            Some(handler) => handler(self, ep_addr, stage),
            None => RequestStatus::Stall,
        };

        if status != RequestStatus::Ok {
            // USB 2.0 section 9.2.7 "Request Error"
            warn!(
                "EP{} STALL {=u8:#X} {=u8:#X}",
                ep_addr.index(),
                setup.request_type,
                setup.request
            );
            self.control.stall();
            self.hw.stall(ep_addr);
        }
    }

    /// A setup packet arrived on the control endpoint `ep_addr`
    ///
    /// Starts a new control transaction, and dispatches the SETUP stage.
    pub fn on_setup_complete(&self, ep_addr: EndpointAddress, setup: SetupPacket) {
        debug!(
            "EP{} SETUP {=u8:#X} {=u8:#X} {=u16} {=u16} {=u16}",
            ep_addr.index(),
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );
        self.control.begin(&setup);
        self.dispatch(ep_addr, Stage::Setup);
    }

    /// The control OUT endpoint `ep_addr` may have finished a transfer
    ///
    /// Dispatches the DATA stage for host-to-device requests, or the STATUS
    /// stage for device-to-host requests, then reclaims the endpoint's
    /// transfers.
    pub fn on_control_out_complete(&self, ep_addr: EndpointAddress) {
        if !self.control.is_stalled() {
            let stage = self.control.out_stage();
            debug!("EP{} OUT {}", ep_addr.index(), stage == Stage::Data);
            self.dispatch(ep_addr, stage);
        }
        self.on_transfer_complete(ep_addr);
    }

    /// The control IN endpoint `ep_addr` may have finished a transfer
    ///
    /// Dispatches the DATA stage for device-to-host requests, or the STATUS
    /// stage for host-to-device requests, then reclaims the endpoint's
    /// transfers.
    pub fn on_control_in_complete(&self, ep_addr: EndpointAddress) {
        if !self.control.is_stalled() {
            let stage = self.control.in_stage();
            debug!("EP{} IN {}", ep_addr.index(), stage == Stage::Data);
            self.dispatch(ep_addr, stage);
        }
        self.on_transfer_complete(ep_addr);
    }
}
