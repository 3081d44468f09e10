//! Device Contexts
//!
//! A [`DeviceContext`] is one configured slave: an address, its capabilities
//! (register store and transmit sink), and the frame assembler. The
//! [`Contexts`] table owns a fixed number of them, hands out [`Handle`]s on
//! open, and serializes every access through an async mutex so the receive
//! path and the recovery supervisor never run inside the same context at
//! once.

use core::fmt::Debug;

use embassy_sync::{blocking_mutex::raw::RawMutex, mutex::Mutex};

use crate::{
    assembler::{Assembler, Discard, Framing, Poll, State, FIXED_FRAME_LEN},
    dispatch::dispatch,
    ExceptionCode, RegisterStore, Transmit, DEFAULT_SLAVE_ADDRESS,
};

/// The default number of context slots
pub const MAX_CONTEXTS: usize = 1;

/// Everything needed to open a context
pub struct DeviceConfig<S, T> {
    /// Our slave address
    pub address: u8,
    /// The register store capability
    pub registers: S,
    /// The transmit capability
    pub transmit: T,
    /// How frames are delimited
    pub framing: Framing,
}

impl<S, T> DeviceConfig<S, T> {
    /// A configuration at [`DEFAULT_SLAVE_ADDRESS`] with [`Framing::Fixed`]
    pub fn new(registers: S, transmit: T) -> Self {
        Self {
            address: DEFAULT_SLAVE_ADDRESS,
            registers,
            transmit,
            framing: Framing::Fixed,
        }
    }

    /// Use `address` instead of the default
    pub fn with_address(self, address: u8) -> Self {
        Self { address, ..self }
    }

    /// Use `framing` instead of the default
    pub fn with_framing(self, framing: Framing) -> Self {
        Self { framing, ..self }
    }
}

/// A reply that was sent for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Reply {
    /// The function byte of the request
    pub function: u8,
    /// The exception sent, if the request was refused
    pub exception: Option<ExceptionCode>,
    /// Bytes reported as sent by the transmit sink, zero on failure
    pub sent: usize,
}

/// What happened to one received byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Event {
    /// Not part of a frame for us
    Ignored,
    /// Buffered into the current frame
    Buffered,
    /// The current frame was thrown away
    Discarded(Discard),
    /// The byte completed a frame, and a reply was sent
    Replied(Reply),
}

/// A summary of feeding a chunk of bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct FeedReport {
    /// Replies sent, exceptions included
    pub replies: u16,
    /// Replies that were exceptions
    pub exceptions: u16,
    /// Partial frames thrown away
    pub discarded: u16,
    /// Replies the transmit sink failed to send
    pub tx_failures: u16,
}

impl FeedReport {
    fn record(&mut self, event: &Event) {
        match event {
            Event::Ignored | Event::Buffered => {}
            Event::Discarded(_) => self.discarded = self.discarded.saturating_add(1),
            Event::Replied(reply) => {
                self.replies = self.replies.saturating_add(1);
                if reply.exception.is_some() {
                    self.exceptions = self.exceptions.saturating_add(1);
                }
                if reply.sent == 0 {
                    self.tx_failures = self.tx_failures.saturating_add(1);
                }
            }
        }
    }
}

/// One configured slave device
pub struct DeviceContext<S, T, const CAP: usize = FIXED_FRAME_LEN> {
    assembler: Assembler<CAP>,
    registers: S,
    transmit: T,
}

impl<S, T, const CAP: usize> DeviceContext<S, T, CAP>
where
    S: RegisterStore,
    T: Transmit,
{
    /// Create a new, idle context
    pub fn new(config: DeviceConfig<S, T>) -> Self {
        Self {
            assembler: Assembler::new(config.address, config.framing),
            registers: config.registers,
            transmit: config.transmit,
        }
    }

    /// Feed one received byte
    ///
    /// If the byte completes a valid frame, the request is served and the
    /// reply is sent before this returns.
    pub fn poll(&mut self, byte: u8) -> Event {
        let Self {
            assembler,
            registers,
            transmit,
        } = self;
        let address = assembler.address();

        let polled = assembler.poll(byte, |frame| {
            let resp = dispatch(&frame, address, &*registers);
            let exception = resp.exception_code();
            let sent = resp.send(transmit);
            Reply {
                function: frame.function(),
                exception,
                sent,
            }
        });

        match polled {
            Poll::Skipped => Event::Ignored,
            Poll::Buffered => Event::Buffered,
            Poll::Discarded(why) => Event::Discarded(why),
            Poll::Dispatched(reply) => Event::Replied(reply),
        }
    }

    /// Feed a received chunk, in order
    pub fn feed(&mut self, bytes: &[u8]) -> FeedReport {
        let mut report = FeedReport::default();
        for &b in bytes {
            let event = self.poll(b);
            report.record(&event);
        }
        report
    }
}

impl<S, T, const CAP: usize> DeviceContext<S, T, CAP> {
    /// Drop any partial frame, returning to [`State::Idle`]
    #[inline]
    pub fn flush(&mut self) {
        self.assembler.flush();
    }

    /// The assembler state
    #[inline]
    pub fn state(&self) -> State {
        self.assembler.state()
    }

    /// The number of bytes of the current frame buffered so far
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.assembler.buffered_len()
    }

    /// The running CRC accumulator
    #[inline]
    pub fn running_crc(&self) -> u16 {
        self.assembler.running_crc()
    }

    /// Our slave address
    #[inline]
    pub fn address(&self) -> u8 {
        self.assembler.address()
    }

    /// Borrow the register store
    #[inline]
    pub fn registers(&self) -> &S {
        &self.registers
    }

    /// Deconstruct the context, handing back its configuration
    pub fn into_config(self) -> DeviceConfig<S, T> {
        DeviceConfig {
            address: self.assembler.address(),
            registers: self.registers,
            transmit: self.transmit,
            framing: self.assembler.framing(),
        }
    }
}

/// An opaque reference to an open context
///
/// A handle goes stale when its context is closed, even if the slot is
/// reused by a later [`Contexts::open()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Handle {
    index: usize,
    generation: u32,
}

/// An error when using a [`Handle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ContextError {
    /// The handle does not refer to an open context
    StaleHandle,
    /// The table is locked elsewhere, only returned by the `try_*` methods
    Busy,
}

/// An error when opening a context
///
/// The rejected configuration is handed back.
#[non_exhaustive]
pub enum OpenError<S, T> {
    /// Every slot is in use
    NoFreeSlot(DeviceConfig<S, T>),
}

impl<S, T> OpenError<S, T> {
    /// Recover the rejected configuration
    pub fn into_config(self) -> DeviceConfig<S, T> {
        match self {
            OpenError::NoFreeSlot(cfg) => cfg,
        }
    }
}

impl<S, T> Debug for OpenError<S, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("OpenError::")?;
        let remain = match self {
            OpenError::NoFreeSlot(_) => "NoFreeSlot(...)",
        };
        f.write_str(remain)
    }
}

struct Slot<S, T, const CAP: usize> {
    generation: u32,
    ctx: Option<DeviceContext<S, T, CAP>>,
}

impl<S, T, const CAP: usize> Slot<S, T, CAP> {
    const EMPTY: Self = Self {
        generation: 0,
        ctx: None,
    };
}

fn lookup<S, T, const CAP: usize>(
    slots: &mut [Slot<S, T, CAP>],
    handle: Handle,
) -> Result<&mut DeviceContext<S, T, CAP>, ContextError> {
    slots
        .get_mut(handle.index)
        .filter(|s| s.generation == handle.generation)
        .and_then(|s| s.ctx.as_mut())
        .ok_or(ContextError::StaleHandle)
}

/// A fixed size table of device contexts
///
/// Intended to be used as a static, shared between the receive path (which
/// feeds bytes) and the main loop (which runs the recovery supervisor):
///
/// ```rust
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
/// use rtu_slave::{context::Contexts, registers::RegisterBank, Transmit};
///
/// struct Uart;
///
/// impl Transmit for Uart {
///     fn transmit(&mut self, frame: &[u8]) -> usize {
///         frame.len()
///     }
/// }
///
/// static REGISTERS: RegisterBank = RegisterBank::new();
/// static CONTEXTS: Contexts<CriticalSectionRawMutex, &'static RegisterBank, Uart> =
///     Contexts::new();
/// ```
///
/// The table contains an async Mutex. It stays locked while a chunk is fed,
/// which includes serving any completed requests and transmitting their
/// replies. The raw mutex `R` is only held for the instant it takes to
/// acquire or release the lock, never across a transmit, so interrupts (and
/// [`Supervisor::mark_error()`][crate::recovery::Supervisor::mark_error]) are
/// not held off by a slow send.
pub struct Contexts<
    R: RawMutex,
    S,
    T,
    const N: usize = MAX_CONTEXTS,
    const CAP: usize = FIXED_FRAME_LEN,
> {
    slots: Mutex<R, [Slot<S, T, CAP>; N]>,
}

/// Instantiation and lifecycle methods
impl<R, S, T, const N: usize, const CAP: usize> Contexts<R, S, T, N, CAP>
where
    R: RawMutex,
    S: RegisterStore,
    T: Transmit,
{
    /// Create a new table with every slot closed
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([Slot::<S, T, CAP>::EMPTY; N]),
        }
    }

    /// Open a context in the first free slot
    pub async fn open(&self, config: DeviceConfig<S, T>) -> Result<Handle, OpenError<S, T>> {
        let mut slots = self.slots.lock().await;
        let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.ctx.is_none())
        else {
            mb_warn!("no free context slot");
            return Err(OpenError::NoFreeSlot(config));
        };
        mb_info!("opening context {=usize} at address {=u8}", index, config.address);
        slot.ctx = Some(DeviceContext::new(config));
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Close a context, handing back its configuration
    pub async fn close(&self, handle: Handle) -> Result<DeviceConfig<S, T>, ContextError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .ok_or(ContextError::StaleHandle)?;
        let ctx = slot.ctx.take().ok_or(ContextError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        mb_info!("closed context {=usize}", handle.index);
        Ok(ctx.into_config())
    }

    /// The number of open contexts
    pub async fn open_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .iter()
            .filter(|s| s.ctx.is_some())
            .count()
    }
}

/// Context access methods
impl<R, S, T, const N: usize, const CAP: usize> Contexts<R, S, T, N, CAP>
where
    R: RawMutex,
    S: RegisterStore,
    T: Transmit,
{
    /// Run `f` with exclusive access to an open context
    ///
    /// Waits for the table lock, so the only error is
    /// [`ContextError::StaleHandle`].
    pub async fn with<F, O>(&self, handle: Handle, f: F) -> Result<O, ContextError>
    where
        F: FnOnce(&mut DeviceContext<S, T, CAP>) -> O,
    {
        let mut slots = self.slots.lock().await;
        lookup(slots.as_mut_slice(), handle).map(f)
    }

    /// Like [`Contexts::with()`], but fails with [`ContextError::Busy`]
    /// instead of waiting if the table is locked
    pub fn try_with<F, O>(&self, handle: Handle, f: F) -> Result<O, ContextError>
    where
        F: FnOnce(&mut DeviceContext<S, T, CAP>) -> O,
    {
        let mut slots = self.slots.try_lock().map_err(|_| ContextError::Busy)?;
        lookup(slots.as_mut_slice(), handle).map(f)
    }

    /// Feed one received byte to a context
    pub async fn poll(&self, handle: Handle, byte: u8) -> Result<Event, ContextError> {
        self.with(handle, |ctx| ctx.poll(byte)).await
    }

    /// Feed a received chunk to a context
    pub async fn feed(&self, handle: Handle, bytes: &[u8]) -> Result<FeedReport, ContextError> {
        self.with(handle, |ctx| ctx.feed(bytes)).await
    }

    /// Drop any partial frame of a context
    pub async fn flush(&self, handle: Handle) -> Result<(), ContextError> {
        self.with(handle, |ctx| ctx.flush()).await
    }

    /// Drop any partial frame of a context, without waiting for the lock
    pub fn try_flush(&self, handle: Handle) -> Result<(), ContextError> {
        self.try_with(handle, |ctx| ctx.flush())
    }

    /// The assembler state of a context
    pub async fn state(&self, handle: Handle) -> Result<State, ContextError> {
        self.with(handle, |ctx| ctx.state()).await
    }

    /// Does `handle` refer to an open context?
    ///
    /// A locked table is waited for, never reported as closed.
    pub async fn is_open(&self, handle: Handle) -> bool {
        self.with(handle, |_| ()).await.is_ok()
    }
}
