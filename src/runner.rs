//! Task glue
//!
//! The two long running pieces of a slave:
//!
//! * [`Slave::run()`], the receive task, which waits for received chunks and
//!   feeds them to its context
//! * [`supervise()`], the main loop task, which ticks the [`Supervisor`]
//!
//! They communicate through the shared [`Contexts`] table, the
//! [`Supervisor`], and a re-arm [`Signal`] raised by [`ContextRecovery`].

use embassy_sync::{blocking_mutex::raw::RawMutex, signal::Signal};
use embassy_time::Ticker;
use futures::{
    future::{select, Either},
    pin_mut,
};

use crate::{
    assembler::FIXED_FRAME_LEN,
    context::{ContextError, Contexts, FeedReport, Handle, MAX_CONTEXTS},
    recovery::{Clock, Recover, Supervisor, TICK_PERIOD},
    Error, RegisterStore, Transmit,
};

/// The size of the receive buffer used by [`Slave::run()`]
pub const RX_CHUNK_LEN: usize = 256;

/// A trait representing the receiving half of the serial line
pub trait ByteSource {
    /// The error type of the underlying serial port
    type SerError;

    /// Receive one chunk of bytes
    ///
    /// The chunk ends when the line goes idle or `buf` is full, whichever
    /// comes first. Returns the number of bytes written into `buf`.
    ///
    /// This function MUST be cancellation safe: it is raced against re-arm
    /// requests.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error<Self::SerError>>;

    /// Restart reception, clearing any latched error flags
    fn rearm(&mut self);
}

/// Metadata trait to contain relevant generics
pub trait SlaveCfg {
    /// Mutex type used for the context table and the re-arm signal
    type Mutex: RawMutex + 'static;

    /// Register store capability
    type Registers: RegisterStore;

    /// Transmit capability
    type Transmit: Transmit;

    /// Receive capability
    type Source: ByteSource;

    /// Tick source of the supervisor
    type Clock: Clock;
}

/// The receive task of one slave
pub struct Slave<'a, Cfg, const N: usize = MAX_CONTEXTS, const CAP: usize = FIXED_FRAME_LEN>
where
    Cfg: SlaveCfg,
{
    contexts: &'a Contexts<Cfg::Mutex, Cfg::Registers, Cfg::Transmit, N, CAP>,
    handle: Handle,
    source: Cfg::Source,
    supervisor: &'a Supervisor<Cfg::Clock>,
    rearm: &'a Signal<Cfg::Mutex, ()>,
}

impl<'a, Cfg, const N: usize, const CAP: usize> Slave<'a, Cfg, N, CAP>
where
    Cfg: SlaveCfg,
{
    /// Create a new [Slave] worker for an open context.
    pub fn new(
        contexts: &'a Contexts<Cfg::Mutex, Cfg::Registers, Cfg::Transmit, N, CAP>,
        handle: Handle,
        source: Cfg::Source,
        supervisor: &'a Supervisor<Cfg::Clock>,
        rearm: &'a Signal<Cfg::Mutex, ()>,
    ) -> Self {
        Self {
            contexts,
            handle,
            source,
            supervisor,
            rearm,
        }
    }

    /// Serve requests until the context is closed
    pub async fn run(&mut self) {
        let mut buf = [0u8; RX_CHUNK_LEN];
        loop {
            match self.serve_one(&mut buf).await {
                Ok(_) => {}
                Err(ContextError::StaleHandle) => {
                    mb_info!("context closed, stopping");
                    return;
                }
                Err(_e) => {
                    mb_warn!("context access failed: {}", _e);
                }
            }
        }
    }

    /// Wait for one chunk, or a re-arm request, and handle it
    ///
    /// Returns `Ok(None)` if nothing was fed to the context.
    pub async fn serve_one(&mut self, buf: &mut [u8]) -> Result<Option<FeedReport>, ContextError> {
        if !self.contexts.is_open(self.handle).await {
            return Err(ContextError::StaleHandle);
        }

        let received = {
            let recv = self.source.recv(buf);
            let rearm = self.rearm.wait();
            pin_mut!(recv, rearm);
            match select(recv, rearm).await {
                Either::Left((res, _)) => Some(res),
                Either::Right(((), _)) => None,
            }
        };

        let result = match received {
            None => {
                // The recovery action cannot wait for the table, so the
                // flush is repeated here where it can
                mb_debug!("re-arm requested");
                self.contexts.flush(self.handle).await.map(|()| None)
            }
            Some(Ok(n)) => {
                let chunk = &buf[..n.min(buf.len())];
                if !chunk.is_empty() {
                    self.supervisor.mark_activity();
                }
                self.contexts
                    .feed(self.handle, chunk)
                    .await
                    .map(|report| {
                        for _ in 0..report.tx_failures {
                            self.supervisor.mark_error();
                        }
                        Some(report)
                    })
            }
            Some(Err(Error::Serial(_))) => {
                mb_warn!("receive error");
                self.supervisor.mark_error();
                Ok(None)
            }
        };

        self.source.rearm();
        result
    }

    /// The handle of the context this worker feeds
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

/// The standard reset action
///
/// Drops any partial frame of the context, and asks its [`Slave`] to re-arm
/// reception. If the table is locked by the receive path at that moment, the
/// partial frame is dropped by the [`Slave`] when it handles the re-arm.
pub struct ContextRecovery<'a, R, S, T, const N: usize = MAX_CONTEXTS, const CAP: usize = FIXED_FRAME_LEN>
where
    R: RawMutex,
{
    contexts: &'a Contexts<R, S, T, N, CAP>,
    handle: Handle,
    rearm: &'a Signal<R, ()>,
}

impl<'a, R, S, T, const N: usize, const CAP: usize> ContextRecovery<'a, R, S, T, N, CAP>
where
    R: RawMutex,
{
    /// Create a new reset action for the context at `handle`
    pub fn new(
        contexts: &'a Contexts<R, S, T, N, CAP>,
        handle: Handle,
        rearm: &'a Signal<R, ()>,
    ) -> Self {
        Self {
            contexts,
            handle,
            rearm,
        }
    }
}

impl<'a, R, S, T, const N: usize, const CAP: usize> Recover for ContextRecovery<'a, R, S, T, N, CAP>
where
    R: RawMutex,
    S: RegisterStore,
    T: Transmit,
{
    fn recover(&mut self) {
        if let Err(_e) = self.contexts.try_flush(self.handle) {
            mb_debug!("flush deferred to the receive task: {}", _e);
        }
        self.rearm.signal(());
    }
}

/// Run the recovery policy forever, once every [`TICK_PERIOD`]
pub async fn supervise<C, R>(supervisor: &Supervisor<C>, target: &mut R)
where
    C: Clock,
    R: Recover + ?Sized,
{
    let mut ticker = Ticker::every(TICK_PERIOD);
    loop {
        ticker.next().await;
        supervisor.update(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::DeviceConfig,
        crc::crc16,
        recovery::{EmbassyClock, Millis, RecoveryConfig},
        registers::RegisterBank,
        DEVICE_REGISTERS,
    };
    use core::cell::Cell;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_time::{Duration, Timer};
    use futures::executor::block_on;
    use std::{collections::VecDeque, vec::Vec};

    type Table<'a> = Contexts<NoopRawMutex, &'a RegisterBank, Capture>;

    #[derive(Default)]
    struct Capture {
        frames: Vec<Vec<u8>>,
    }

    impl Transmit for Capture {
        fn transmit(&mut self, frame: &[u8]) -> usize {
            self.frames.push(frame.to_vec());
            frame.len()
        }
    }

    struct Frozen(Cell<u32>);

    impl Clock for Frozen {
        fn now(&self) -> Millis {
            Millis(self.0.get())
        }
    }

    /// Plays back a script of chunks, then closes the context
    struct Script<'a, 'b> {
        chunks: VecDeque<Result<Vec<u8>, ()>>,
        rearms: &'b Cell<usize>,
        close: Option<(&'b Table<'a>, Handle)>,
    }

    impl<'a, 'b> ByteSource for Script<'a, 'b> {
        type SerError = ();

        async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error<()>> {
            match self.chunks.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(())) => Err(Error::Serial(())),
                None => {
                    if let Some((table, handle)) = self.close.take() {
                        let _ = table.close(handle).await;
                        Ok(0)
                    } else {
                        futures::future::pending().await
                    }
                }
            }
        }

        fn rearm(&mut self) {
            self.rearms.set(self.rearms.get() + 1);
        }
    }

    struct TestCfg<'a, 'b>(core::marker::PhantomData<(&'a (), &'b ())>);

    impl<'a: 'b, 'b> SlaveCfg for TestCfg<'a, 'b> {
        type Mutex = NoopRawMutex;
        type Registers = &'a RegisterBank;
        type Transmit = Capture;
        type Source = Script<'a, 'b>;
        type Clock = &'b Frozen;
    }

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut v = body.to_vec();
        v.extend_from_slice(&crc16(body).to_le_bytes());
        v
    }

    fn countdown() -> RegisterBank {
        let mut init = [0u16; DEVICE_REGISTERS];
        init.iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = (DEVICE_REGISTERS - i) as u16);
        RegisterBank::with_values(init)
    }

    #[test]
    fn serves_until_closed() {
        let regs = countdown();
        let table: Table<'_> = Contexts::new();
        let handle = block_on(table.open(DeviceConfig::new(&regs, Capture::default()))).unwrap();
        let clock = Frozen(Cell::new(0));
        let sup = Supervisor::new(&clock, RecoveryConfig::DEFAULT);
        let rearm = Signal::new();
        let rearms = Cell::new(0);

        let request = with_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x2A]);
        let source = Script {
            chunks: VecDeque::from([
                Ok(request[..3].to_vec()),
                Ok(request[3..].to_vec()),
                Err(()),
            ]),
            rearms: &rearms,
            close: Some((&table, handle)),
        };

        let mut slave: Slave<'_, TestCfg<'_, '_>> = Slave::new(&table, handle, source, &sup, &rearm);
        block_on(slave.run());

        assert!(!block_on(table.is_open(handle)));
        assert_eq!(regs.read(40002), 42);
        assert_eq!(sup.error_count(), 1);
        // Every delivery re-arms, including the one that closed the context
        assert_eq!(rearms.get(), 4);
    }

    #[test]
    fn rearm_request_wins_over_a_quiet_line() {
        let regs = countdown();
        let table: Table<'_> = Contexts::new();
        let handle = block_on(table.open(DeviceConfig::new(&regs, Capture::default()))).unwrap();
        block_on(table.feed(handle, &[0x01, 0x03])).unwrap();

        let clock = Frozen(Cell::new(0));
        let sup = Supervisor::new(&clock, RecoveryConfig::DEFAULT);
        let rearm = Signal::new();
        let rearms = Cell::new(0);
        let source = Script {
            chunks: VecDeque::new(),
            rearms: &rearms,
            close: None,
        };
        let mut slave: Slave<'_, TestCfg<'_, '_>> = Slave::new(&table, handle, source, &sup, &rearm);

        // The supervisor trips on a silent line
        clock.0.set(2501);
        let mut reset = ContextRecovery::new(&table, handle, &rearm);
        assert!(sup.update(&mut reset).is_some());
        assert_eq!(table.try_with(handle, |ctx| ctx.buffered_len()), Ok(0));

        let mut buf = [0u8; RX_CHUNK_LEN];
        assert_eq!(block_on(slave.serve_one(&mut buf)), Ok(None));
        assert_eq!(rearms.get(), 1);
    }

    #[test]
    fn recovery_during_a_feed_is_finished_by_the_receive_task() {
        let regs = countdown();
        let table: Table<'_> = Contexts::new();
        let handle = block_on(table.open(DeviceConfig::new(&regs, Capture::default()))).unwrap();
        block_on(table.feed(handle, &[0x01, 0x03, 0x00])).unwrap();

        let clock = Frozen(Cell::new(2501));
        let sup = Supervisor::new(&clock, RecoveryConfig::DEFAULT);
        let rearm = Signal::new();
        let rearms = Cell::new(0);
        let source = Script {
            chunks: VecDeque::new(),
            rearms: &rearms,
            close: None,
        };
        let mut slave: Slave<'_, TestCfg<'_, '_>> = Slave::new(&table, handle, source, &sup, &rearm);

        // The table is locked, so the reset can only raise the signal
        let mut reset = ContextRecovery::new(&table, handle, &rearm);
        let tripped = block_on(table.with(handle, |_| sup.update(&mut reset))).unwrap();
        assert!(tripped.is_some());
        assert_eq!(table.try_with(handle, |ctx| ctx.buffered_len()), Ok(3));

        let mut buf = [0u8; RX_CHUNK_LEN];
        assert_eq!(block_on(slave.serve_one(&mut buf)), Ok(None));
        assert_eq!(table.try_with(handle, |ctx| ctx.buffered_len()), Ok(0));
        assert_eq!(rearms.get(), 1);
    }

    #[test]
    fn transmit_failures_count_as_errors() {
        struct Broken;

        impl Transmit for Broken {
            fn transmit(&mut self, _frame: &[u8]) -> usize {
                0
            }
        }

        struct BrokenCfg<'a, 'b>(core::marker::PhantomData<(&'a (), &'b ())>);

        impl<'a, 'b> SlaveCfg for BrokenCfg<'a, 'b> {
            type Mutex = NoopRawMutex;
            type Registers = &'a RegisterBank;
            type Transmit = Broken;
            type Source = Chunks;
            type Clock = &'b Frozen;
        }

        struct Chunks(VecDeque<Vec<u8>>);

        impl ByteSource for Chunks {
            type SerError = ();

            async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error<()>> {
                let chunk = self.0.pop_front().unwrap_or_default();
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }

            fn rearm(&mut self) {}
        }

        let regs = countdown();
        let table: Contexts<NoopRawMutex, &RegisterBank, Broken> = Contexts::new();
        let handle = block_on(table.open(DeviceConfig::new(&regs, Broken))).unwrap();
        let clock = Frozen(Cell::new(0));
        let sup = Supervisor::new(&clock, RecoveryConfig::DEFAULT);
        let rearm = Signal::new();

        let mut two = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        two.extend_from_slice(&with_crc(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x01]));
        let source = Chunks(VecDeque::from([two]));
        let mut slave: Slave<'_, BrokenCfg<'_, '_>> = Slave::new(&table, handle, source, &sup, &rearm);

        let mut buf = [0u8; RX_CHUNK_LEN];
        let report = block_on(slave.serve_one(&mut buf)).unwrap().unwrap();
        assert_eq!(report.replies, 2);
        assert_eq!(report.tx_failures, 2);
        assert_eq!(sup.error_count(), 2);
    }

    #[test]
    fn supervise_ticks_the_policy() {
        let config = RecoveryConfig {
            inactivity_timeout: Duration::from_millis(20),
            ..RecoveryConfig::DEFAULT
        };
        let sup = Supervisor::new(EmbassyClock, config);
        sup.restart();
        let mut resets = 0u32;
        let mut target = || resets += 1;

        block_on(async {
            let ticking = supervise(&sup, &mut target);
            let deadline = Timer::after(Duration::from_millis(200));
            pin_mut!(ticking, deadline);
            select(ticking, deadline).await;
        });

        assert!(resets >= 1);
        assert_eq!(sup.recoveries(), resets);
    }
}
