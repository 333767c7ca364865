use std::fmt;

/// The kind of probe call that returned a failing status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Reading target memory.
    ReadMemory,
    /// Writing a 32-bit word to target memory.
    WriteMemory,
    /// Reading an RTT channel through the probe's native RTT engine.
    RttRead,
    /// Starting or stopping the probe's native RTT engine.
    RttControl,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::ReadMemory => "memory read",
            Operation::WriteMemory => "memory write",
            Operation::RttRead => "native RTT read",
            Operation::RttControl => "native RTT control",
        })
    }
}

/// Error type for probe and RTT operations.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// Failed to load the probe library {name}: {source}
    LoadFailure {
        /// The path or file name handed to the loader.
        name: String,
        /// The error reported by the platform loader.
        source: libloading::Error,
    },

    /// The probe library does not export `{symbol}`. The installed library is probably incompatible.
    SymbolNotFound {
        /// Name of the missing entry point.
        symbol: &'static str,
        /// The error reported by the platform loader.
        source: libloading::Error,
    },

    /// Failed to connect to the probe: {0}
    ConnectionFailed(String),

    /// The probe connection is already open.
    AlreadyConnected,

    /// The probe connection is not open.
    NotConnected,

    /// RTT control block not found in target memory.
    /// - Make sure RTT is initialized on the target before attaching.
    /// - Make sure the control block address or scan range is correct.
    ControlBlockNotFound,

    /// The control block has been corrupted: {0}
    ControlBlockCorrupted(String),

    /// Up channel {0} does not exist.
    MissingChannel(u32),

    /// Invalid ring buffer state: size={size} write={write} read={read}
    InvalidRingState {
        /// Declared capacity of the ring buffer.
        size: u32,
        /// Write offset as read from the target.
        write: u32,
        /// Read offset as read from the target.
        read: u32,
    },

    /// Probe {operation} failed at {address:#010x} ({size} bytes) with status {status}
    ProbeIo {
        /// The failing call.
        operation: Operation,
        /// Target address of the access, or the channel index for native RTT calls.
        address: u32,
        /// Number of bytes requested.
        size: u32,
        /// Status code returned by the probe library.
        status: i32,
    },

    /// The probe library does not provide a native RTT engine.
    NativeRttUnavailable,

    /// Invalid configuration: {0}
    InvalidConfig(String),
}

impl Error {
    /// Returns `true` if the caller may simply retry on the next poll.
    ///
    /// Covers transient probe failures, torn ring offsets and a control block the firmware has
    /// not finished setting up yet. `NotConnected` is included because reopening the session
    /// makes reads work again; [`RttPoller`](crate::RttPoller) ends on it instead, since only
    /// the session owner can reopen.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidRingState { .. }
                | Error::ProbeIo { .. }
                | Error::NotConnected
                | Error::ControlBlockNotFound
                | Error::ControlBlockCorrupted(_)
        )
    }
}
