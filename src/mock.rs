//! A pretend controller for host tests

extern crate std;

use crate::{
    control::Stage,
    hardware::Hardware,
    queue::Completion,
    td::{self, Status, Td},
};
use std::{
    boxed::Box,
    cell::{Cell, RefCell},
    thread_local,
    vec::Vec,
};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

pub fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

pub fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

pub fn ep1_in() -> EndpointAddress {
    EndpointAddress::from_parts(1, UsbDirection::In)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Wait(EndpointAddress, *const Td),
    Append(EndpointAddress, *const Td, *const Td),
    Stall(EndpointAddress),
    Dispatch(EndpointAddress, Stage),
    Error(EndpointAddress, Status),
}

#[derive(Default)]
pub struct Mock {
    events: RefCell<Vec<Event>>,
    masked: Cell<bool>,
    masks: Cell<usize>,
    stalls: Cell<usize>,
    waits: Cell<usize>,
    interrupt: RefCell<Option<Box<dyn Fn()>>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    /// Drain all recorded events
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Every TD handed to the controller, in order
    pub fn scheduled(&self) -> Vec<*const Td> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match *event {
                Event::Wait(_, td) | Event::Append(_, _, td) => Some(td),
                _ => None,
            })
            .collect()
    }

    /// How many times any endpoint was stalled
    ///
    /// Unaffected by draining [`events`](Mock::events).
    pub fn stalls(&self) -> usize {
        self.stalls.get()
    }

    pub fn is_masked(&self) -> bool {
        self.masked.get()
    }

    /// How many times the interrupt was masked from an unmasked state
    pub fn masks(&self) -> usize {
        self.masks.get()
    }

    /// How many times a caller waited for a free transfer
    pub fn waits(&self) -> usize {
        self.waits.get()
    }

    /// Run `isr` whenever a caller waits for a free transfer
    pub fn on_wait(&self, isr: impl Fn() + 'static) {
        *self.interrupt.borrow_mut() = Some(Box::new(isr));
    }

    /// Act like the USB interrupt handler is running
    pub fn in_interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let was = self.masked.replace(true);
        let result = f();
        self.masked.set(was);
        result
    }

    /// Retire `td` as if the controller moved all but `remaining` bytes
    pub fn retire(&self, td: *const Td, remaining: usize) {
        self.retire_with(td, remaining, Status::empty());
    }

    pub fn retire_with(&self, td: *const Td, remaining: usize, status: Status) {
        // Safety: tests keep the pools alive longer than the mock's records.
        td::retire(unsafe { &*td }, remaining, status);
    }
}

impl Hardware for Mock {
    fn schedule_wait(&self, endpoint: EndpointAddress, td: &Td) {
        assert!(self.is_masked(), "priming without the interrupt masked");
        self.record(Event::Wait(endpoint, td));
    }
    fn schedule_append(&self, endpoint: EndpointAddress, tail: &Td, td: &Td) {
        assert!(self.is_masked(), "appending without the interrupt masked");
        tail.set_next(td);
        self.record(Event::Append(endpoint, tail, td));
    }
    fn stall(&self, endpoint: EndpointAddress) {
        self.stalls.set(self.stalls.get() + 1);
        self.record(Event::Stall(endpoint));
    }
    fn transfer_error(&self, endpoint: EndpointAddress, status: Status) {
        self.record(Event::Error(endpoint, status));
    }
    fn wait_for_transfer(&self, _: EndpointAddress) {
        self.waits.set(self.waits.get() + 1);
        let interrupt = self.interrupt.borrow();
        let isr = interrupt
            .as_ref()
            .expect("waiting for a transfer that nothing will free");
        self.in_interrupt(isr);
    }
    fn mask_interrupt(&self) -> bool {
        let unmasked = !self.masked.replace(true);
        if unmasked {
            self.masks.set(self.masks.get() + 1);
        }
        unmasked
    }
    fn unmask_interrupt(&self) {
        self.masked.set(false);
    }
}

thread_local! {
    static COMPLETIONS: RefCell<Vec<(usize, Completion)>> = RefCell::new(Vec::new());
    static DCACHE: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// A completion callback that remembers what it saw
pub fn record(user_data: usize, completion: Completion) {
    COMPLETIONS.with(|completions| completions.borrow_mut().push((user_data, completion)));
}

/// Drain everything seen by [`record`] on this thread
pub fn completions() -> Vec<(usize, Completion)> {
    COMPLETIONS.with(|completions| completions.borrow_mut().drain(..).collect())
}

/// Stands in for D-cache maintenance on the host
pub fn clean_invalidate_dcache(addr: usize) {
    DCACHE.with(|lines| lines.borrow_mut().push(addr));
}

/// Drain every address that was cleaned and invalidated on this thread
pub fn dcache() -> Vec<usize> {
    DCACHE.with(|lines| lines.borrow_mut().drain(..).collect())
}
