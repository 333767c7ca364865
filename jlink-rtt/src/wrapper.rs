//! The session facade: one probe, one control block, one reusable read buffer.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rtt::{read_up_channel, BufferDescriptor, ChannelInfo, ControlBlock, ScanRegion};
use crate::{Error, JLinkProbe, Probe, ProbeConfig};

/// How [`RttWrapper::read_rtt`] gets at the channel data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Use the probe's native RTT engine if it has one, soft RTT otherwise.
    #[default]
    Auto,
    /// Always use the probe's native RTT engine.
    Native,
    /// Always walk the control block with plain memory accesses.
    Soft,
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ReadMode::Auto),
            "native" => Ok(ReadMode::Native),
            "soft" => Ok(ReadMode::Soft),
            other => Err(format!(
                "Unknown read mode '{other}', expected one of auto, native, soft"
            )),
        }
    }
}

/// RTT settings of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RttConfig {
    /// Where the control block lives.
    pub scan_region: ScanRegion,

    /// How channels are read.
    #[serde(default)]
    pub mode: ReadMode,

    /// Capacity of the reusable read buffer, and so the most a single read returns.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl RttConfig {
    /// Read buffer capacity used when the configuration does not set one.
    pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

    /// Default settings for a control block in `scan_region`.
    pub fn new(scan_region: ScanRegion) -> Self {
        Self {
            scan_region,
            mode: ReadMode::default(),
            buffer_capacity: Self::DEFAULT_BUFFER_CAPACITY,
        }
    }
}

fn default_buffer_capacity() -> usize {
    RttConfig::DEFAULT_BUFFER_CAPACITY
}

/// An RTT session on top of a [`Probe`].
///
/// The read buffer is allocated once in [`RttWrapper::new`] and reused by every read. The
/// control block is located on first use and cached until the probe is closed. Access to a
/// wrapper shared between threads has to be serialized by the caller, see
/// [`RttPoller`](crate::RttPoller).
pub struct RttWrapper<P: Probe> {
    config: RttConfig,
    probe: Option<P>,
    buffer: Box<[u8]>,
    control_block: Option<ControlBlock>,
    last_descriptor: Option<(u32, BufferDescriptor)>,
    native_started: bool,
    degraded: bool,
}

impl<P: Probe> RttWrapper<P> {
    /// Creates a disconnected session.
    pub fn new(config: RttConfig) -> Result<Self, Error> {
        if config.buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "The RTT buffer capacity must not be zero".to_string(),
            ));
        }

        let buffer = vec![0u8; config.buffer_capacity].into_boxed_slice();

        Ok(Self {
            config,
            probe: None,
            buffer,
            control_block: None,
            last_descriptor: None,
            native_started: false,
            degraded: false,
        })
    }

    /// Takes ownership of a connected probe.
    pub fn open(&mut self, probe: P) -> Result<(), Error> {
        if self.probe.is_some() {
            return Err(Error::AlreadyConnected);
        }

        self.invalidate();
        self.probe = Some(probe);
        Ok(())
    }

    /// Closes the probe. Reads fail with [`Error::NotConnected`] until [`open`](Self::open) is
    /// called again.
    pub fn close(&mut self) -> Result<(), Error> {
        let mut probe = self.probe.take().ok_or(Error::NotConnected)?;
        self.invalidate();
        probe.close()
    }

    fn invalidate(&mut self) {
        self.control_block = None;
        self.last_descriptor = None;
        self.native_started = false;
        self.degraded = false;
    }

    /// Returns `true` while a probe is open.
    pub fn is_connected(&self) -> bool {
        self.probe.is_some()
    }

    /// Returns `true` if publishing a read offset failed since the probe was opened. Data read
    /// in such a session may have been delivered more than once.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The settings the session was created with.
    pub fn config(&self) -> &RttConfig {
        &self.config
    }

    /// Capacity of the read buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// The control block, if it has been located in this session.
    pub fn control_block(&self) -> Option<&ControlBlock> {
        self.control_block.as_ref()
    }

    /// Descriptor of `channel` as seen by the last soft RTT read of that channel.
    pub fn last_descriptor(&self, channel: u32) -> Option<BufferDescriptor> {
        self.last_descriptor
            .filter(|(number, _)| *number == channel)
            .map(|(_, descriptor)| descriptor)
    }

    /// The open probe, if any.
    pub fn probe(&self) -> Option<&P> {
        self.probe.as_ref()
    }

    /// Mutable access to the open probe, if any. Reads through it bypass the session state.
    pub fn probe_mut(&mut self) -> Option<&mut P> {
        self.probe.as_mut()
    }

    /// Locates the control block, or returns the one found earlier in this session.
    pub fn attach(&mut self) -> Result<ControlBlock, Error> {
        let probe = self.probe.as_mut().ok_or(Error::NotConnected)?;
        attach(probe, &mut self.control_block, &self.config.scan_region)
    }

    /// Lists the up channels the target has set up.
    pub fn up_channels(&mut self) -> Result<Vec<ChannelInfo>, Error> {
        let control_block = self.attach()?;
        let probe = self.probe.as_mut().ok_or(Error::NotConnected)?;
        control_block.up_channels(probe)
    }

    /// Reads the pending bytes of up channel `channel`.
    ///
    /// The returned slice borrows the session's read buffer and is overwritten by the next
    /// read; copy it out to keep it. An empty slice means there was nothing to read.
    pub fn read_rtt(&mut self, channel: u32) -> Result<&[u8], Error> {
        let probe = self.probe.as_mut().ok_or(Error::NotConnected)?;
        let control_block = attach(probe, &mut self.control_block, &self.config.scan_region)?;

        let count = if use_native(self.config.mode, probe)? {
            // The native engine does not know how many channels there are.
            control_block.up_descriptor_address(channel)?;

            if !self.native_started {
                probe.start_rtt(control_block.ptr())?;
                self.native_started = true;
            }

            probe.rtt_read(channel, &mut self.buffer)?
        } else {
            let outcome = read_up_channel(probe, &control_block, channel, &mut self.buffer)?;
            self.last_descriptor = Some((channel, outcome.descriptor));

            if !outcome.published && !self.degraded {
                tracing::warn!("RTT session degraded, data on up channel {channel} may repeat");
                self.degraded = true;
            }

            outcome.count
        };

        Ok(&self.buffer[..count.min(self.buffer.len())])
    }
}

impl RttWrapper<JLinkProbe> {
    /// Loads the J-Link library, connects to the target and returns an open session.
    pub fn connect(probe_config: &ProbeConfig, config: RttConfig) -> Result<Self, Error> {
        let mut wrapper = Self::new(config)?;
        wrapper.open(JLinkProbe::open(probe_config)?)?;
        Ok(wrapper)
    }
}

impl<P: Probe> Drop for RttWrapper<P> {
    fn drop(&mut self) {
        if self.probe.is_some() {
            if let Err(error) = self.close() {
                tracing::warn!("Failed to close probe: {error}");
            }
        }
    }
}

fn attach<P: Probe>(
    probe: &mut P,
    cached: &mut Option<ControlBlock>,
    region: &ScanRegion,
) -> Result<ControlBlock, Error> {
    if let Some(control_block) = cached {
        return Ok(*control_block);
    }

    let control_block = ControlBlock::attach(probe, region)?;
    *cached = Some(control_block);
    Ok(control_block)
}

fn use_native<P: Probe>(mode: ReadMode, probe: &P) -> Result<bool, Error> {
    match mode {
        ReadMode::Auto => Ok(probe.supports_native_rtt()),
        ReadMode::Native if probe.supports_native_rtt() => Ok(true),
        ReadMode::Native => Err(Error::NativeRttUnavailable),
        ReadMode::Soft => Ok(false),
    }
}
