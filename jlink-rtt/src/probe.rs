//! The memory access primitives the RTT reader needs from a debug probe.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A connected debug probe, as seen by the RTT reader.
///
/// Every call is synchronous and may block for as long as the probe takes to answer. Calls
/// are never issued concurrently on the same probe.
pub trait Probe: Send {
    /// Copies `data.len()` bytes of target memory starting at `address` into `data`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error>;

    /// Writes a single little-endian 32-bit word to target memory.
    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), Error>;

    /// Returns `true` if the probe has its own RTT engine.
    fn supports_native_rtt(&self) -> bool {
        false
    }

    /// Starts the native RTT engine with the control block at `control_block`.
    fn start_rtt(&mut self, _control_block: u32) -> Result<(), Error> {
        Err(Error::NativeRttUnavailable)
    }

    /// Reads pending bytes of up channel `channel` through the native RTT engine and returns
    /// how many were written to the start of `data`.
    fn rtt_read(&mut self, _channel: u32, _data: &mut [u8]) -> Result<usize, Error> {
        Err(Error::NativeRttUnavailable)
    }

    /// Ends the session. The probe is not used again afterwards.
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<P: Probe + ?Sized> Probe for Box<P> {
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        (**self).read_memory(address, data)
    }

    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), Error> {
        (**self).write_word_32(address, value)
    }

    fn supports_native_rtt(&self) -> bool {
        (**self).supports_native_rtt()
    }

    fn start_rtt(&mut self, control_block: u32) -> Result<(), Error> {
        (**self).start_rtt(control_block)
    }

    fn rtt_read(&mut self, channel: u32, data: &mut [u8]) -> Result<usize, Error> {
        (**self).rtt_read(channel, data)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

/// The debug interface between probe and target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    /// JTAG.
    Jtag,
    /// Serial Wire Debug.
    #[default]
    Swd,
}

impl FromStr for Interface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jtag" => Ok(Interface::Jtag),
            "swd" => Ok(Interface::Swd),
            other => Err(format!("Unknown interface '{other}', expected swd or jtag")),
        }
    }
}

/// Settings used when opening a probe connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Target device name as known to the probe vendor, e.g. `STM32F407VG`.
    pub device: Option<String>,
    /// Debug interface to select.
    pub interface: Interface,
    /// Interface clock in kHz.
    pub speed_khz: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            device: None,
            interface: Interface::Swd,
            speed_khz: 4000,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::MockProbe;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_interface() {
        assert_eq!("SWD".parse::<Interface>(), Ok(Interface::Swd));
        assert_eq!("jtag".parse::<Interface>(), Ok(Interface::Jtag));
        assert!("spi".parse::<Interface>().is_err());
    }

    #[test]
    fn boxed_probe_forwards_calls() {
        let mut probe = MockProbe::new();
        probe.add_range(0x1000, vec![1, 2, 3, 4]);
        let mut probe: Box<dyn Probe> = Box::new(probe);

        let mut data = [0u8; 4];
        probe.read_memory(0x1000, &mut data).unwrap();
        probe.write_word_32(0x1000, 0x0807_0605).unwrap();
        probe.read_memory(0x1000, &mut data[..2]).unwrap();

        assert_eq!(data, [5, 6, 3, 4]);
        assert!(!probe.supports_native_rtt());
        assert!(matches!(
            probe.rtt_read(0, &mut data),
            Err(Error::NativeRttUnavailable)
        ));
    }
}
