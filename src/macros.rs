#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! mb_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! mb_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! mb_trace {
    ($($arg:expr),*) => (mb_log!(trace, $($arg),*));
}

macro_rules! mb_debug {
    ($($arg:expr),*) => (mb_log!(debug, $($arg),*));
}

macro_rules! mb_info {
    ($($arg:expr),*) => (mb_log!(info, $($arg),*));
}

macro_rules! mb_warn {
    ($($arg:expr),*) => (mb_log!(warn, $($arg),*));
}

macro_rules! mb_error {
    ($($arg:expr),*) => (mb_log!(error, $($arg),*));
}
