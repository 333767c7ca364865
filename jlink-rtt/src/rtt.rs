//! Host side implementation of the RTT (Real-Time Transfer) I/O protocol over a J-Link probe.
//!
//! RTT implements output from a microcontroller using in-memory ring buffers and memory
//! polling. The target firmware places a control block in RAM that describes one ring buffer
//! per channel; the host reads the unread part of an up (target to host) buffer and publishes
//! the new read offset back, without ever halting the target.

mod descriptor;
mod reader;

pub use descriptor::{BufferDescriptor, ChannelMode};
pub use reader::{read_up_channel, validate, ReadOutcome, RingState};

use serde::{Deserialize, Serialize};
use std::ops::Range;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::{Error, Probe};

// The control block must follow this data layout in target memory in order to be compatible
// with the official RTT implementation.
//
// struct ControlBlock {
//     char id[16]; // Used to find/validate the control block.
//     // Maximum number of up (target to host) channels in following array
//     unsigned int max_up_channels;
//     // Maximum number of down (host to target) channels in following array.
//     unsigned int max_down_channels;
//     Buffer up_buffers[max_up_channels]; // Array of up (target to host) buffers.
//     Buffer down_buffers[max_down_channels]; // array of down (host to target) buffers.
// }
#[repr(C)]
#[derive(FromBytes, KnownLayout, Immutable)]
struct ControlBlockHeader {
    id: [u8; 16],
    max_up_channels: U32,
    max_down_channels: U32,
}

/// A located RTT control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlBlock {
    ptr: u32,
    max_up_channels: u32,
    max_down_channels: u32,
}

impl ControlBlock {
    /// The magic string expected to be found at the beginning of the RTT control block.
    pub const RTT_ID: [u8; 16] = *b"SEGGER RTT\0\0\0\0\0\0";

    /// Size of the control block header in bytes.
    pub const HEADER_SIZE: usize = std::mem::size_of::<ControlBlockHeader>();

    /// Largest range [`ScanRegion::Range`] may cover.
    pub const MAX_SCAN_LEN: u32 = 1024 * 1024;

    // *Very* conservative sanity check, most people only use a handful of RTT channels
    const MAX_CHANNELS: u32 = 255;

    const MAX_NAME_LEN: usize = 128;

    /// Locates the control block described by `region` and validates its header.
    pub fn attach<P: Probe + ?Sized>(probe: &mut P, region: &ScanRegion) -> Result<Self, Error> {
        let ptr = Self::find_control_block(probe, region)?;
        Self::attach_at(probe, ptr)
    }

    /// Reads and validates the control block header at `ptr`.
    pub fn attach_at<P: Probe + ?Sized>(probe: &mut P, ptr: u32) -> Result<Self, Error> {
        let mut mem = [0u8; Self::HEADER_SIZE];
        probe.read_memory(ptr, &mut mem)?;

        let header: ControlBlockHeader = zerocopy::transmute!(mem);

        // Validate that the control block starts with the ID bytes
        if header.id != Self::RTT_ID {
            tracing::trace!(
                "Expected control block to start with RTT ID: {:?}\n. Got instead: {:?}",
                String::from_utf8_lossy(&Self::RTT_ID),
                String::from_utf8_lossy(&header.id)
            );
            return Err(Error::ControlBlockNotFound);
        }

        let max_up_channels = header.max_up_channels.get();
        let max_down_channels = header.max_down_channels.get();

        if max_up_channels > Self::MAX_CHANNELS || max_down_channels > Self::MAX_CHANNELS {
            return Err(Error::ControlBlockCorrupted(format!(
                "Unexpected array sizes at {ptr:#010x}: max_up_channels={max_up_channels} max_down_channels={max_down_channels}"
            )));
        }

        tracing::debug!(
            "RTT control block at {ptr:#010x} with {max_up_channels} up and {max_down_channels} down channels"
        );

        Ok(Self {
            ptr,
            max_up_channels,
            max_down_channels,
        })
    }

    /// Returns the address of the control block described by `region`.
    pub fn find_control_block<P: Probe + ?Sized>(
        probe: &mut P,
        region: &ScanRegion,
    ) -> Result<u32, Error> {
        let range = match region {
            ScanRegion::Exact(addr) => {
                tracing::debug!("Using control block at exact address: {:#010x}", addr);
                return Ok(*addr);
            }
            ScanRegion::Range { start, end } => *start..*end,
        };

        let range_len = range.end.checked_sub(range.start).unwrap_or(0);
        if range_len > Self::MAX_SCAN_LEN {
            return Err(Error::InvalidConfig(format!(
                "Scan range {:#010x}..{:#010x} is larger than {} bytes",
                range.start,
                range.end,
                Self::MAX_SCAN_LEN
            )));
        }

        tracing::debug!("Scanning region: {:#010x?}", range);

        let mut mem = vec![0; range_len as usize];
        probe.read_memory(range.start, &mut mem)?;

        let offset = mem
            .windows(Self::RTT_ID.len())
            .position(|w| w == Self::RTT_ID)
            .ok_or(Error::ControlBlockNotFound)?;

        Ok(range.start + offset as u32)
    }

    /// Returns the memory address of the control block in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Number of up channel slots in the control block.
    pub fn max_up_channels(&self) -> u32 {
        self.max_up_channels
    }

    /// Number of down channel slots in the control block.
    pub fn max_down_channels(&self) -> u32 {
        self.max_down_channels
    }

    /// Address of the buffer descriptor of up channel `channel`.
    pub fn up_descriptor_address(&self, channel: u32) -> Result<u32, Error> {
        if channel >= self.max_up_channels {
            return Err(Error::MissingChannel(channel));
        }

        // Both factors are bounded by MAX_CHANNELS, so only the base address can overflow.
        let offset = Self::HEADER_SIZE as u32 + channel * BufferDescriptor::SIZE as u32;
        let end = offset + BufferDescriptor::SIZE as u32;
        self.ptr.checked_add(end).map(|_| self.ptr + offset).ok_or_else(|| {
            Error::ControlBlockCorrupted(format!(
                "Descriptor of up channel {channel} lies beyond the address space"
            ))
        })
    }

    /// Reads and decodes the descriptor of up channel `channel`.
    pub fn read_up_descriptor<P: Probe + ?Sized>(
        &self,
        probe: &mut P,
        channel: u32,
    ) -> Result<BufferDescriptor, Error> {
        let address = self.up_descriptor_address(channel)?;
        let mut mem = [0u8; BufferDescriptor::SIZE];
        probe.read_memory(address, &mut mem)?;
        Ok(BufferDescriptor::parse(&mem))
    }

    /// Enumerates the up channels the target has set up.
    pub fn up_channels<P: Probe + ?Sized>(&self, probe: &mut P) -> Result<Vec<ChannelInfo>, Error> {
        if self.max_up_channels == 0 {
            return Ok(Vec::new());
        }

        let start = self.up_descriptor_address(0)?;
        let mut mem = vec![0u8; self.max_up_channels as usize * BufferDescriptor::SIZE];
        probe.read_memory(start, &mut mem)?;

        let mut channels = Vec::new();
        for (number, chunk) in (0u32..).zip(mem.chunks_exact(BufferDescriptor::SIZE)) {
            let Ok(raw) = <&[u8; BufferDescriptor::SIZE]>::try_from(chunk) else {
                continue;
            };
            let descriptor = BufferDescriptor::parse(raw);

            if !descriptor.is_in_use() {
                tracing::warn!("Buffer for up channel {number} not initialized");
                continue;
            }

            let name = if descriptor.name_ptr == 0 {
                None
            } else {
                match read_c_string(probe, descriptor.name_ptr) {
                    Ok(name) => name,
                    Err(error) => {
                        tracing::warn!("Failed to read the name of up channel {number}: {error}");
                        None
                    }
                }
            };

            channels.push(ChannelInfo {
                number,
                name,
                buffer_size: descriptor.size,
                mode: descriptor.mode(),
            });
        }

        Ok(channels)
    }
}

/// Description of one up channel as configured by the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel number.
    pub number: u32,
    /// Channel name, if the target set one.
    pub name: Option<String>,
    /// Ring buffer size in bytes.
    pub buffer_size: u32,
    /// Channel mode, `None` if the flags hold the reserved value.
    pub mode: Option<ChannelMode>,
}

impl std::fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (buffer size {})",
            self.number,
            self.name.as_deref().unwrap_or("(no name)"),
            self.buffer_size
        )
    }
}

/// Reads a null-terminated string from target memory. Lossy UTF-8 decoding is used.
fn read_c_string<P: Probe + ?Sized>(probe: &mut P, ptr: u32) -> Result<Option<String>, Error> {
    // Read up to 128 bytes not going past the end of the address space
    let len = (u32::MAX - ptr).saturating_add(1).min(ControlBlock::MAX_NAME_LEN as u32);
    let mut bytes = vec![0u8; len as usize];
    probe.read_memory(ptr, &mut bytes)?;

    // If the bytes read contain a null, return the preceding part as a string, otherwise None.
    Ok(bytes
        .iter()
        .position(|&b| b == 0)
        .map(|p| String::from_utf8_lossy(&bytes[..p]).into_owned()))
}

/// Where to look for the RTT control block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanRegion {
    /// The control block starts at this exact address.
    Exact(u32),

    /// Search this address range for the control block ID. The range must not be larger than
    /// [`ControlBlock::MAX_SCAN_LEN`] and must be readable in its entirety.
    Range {
        /// First address of the range.
        start: u32,
        /// First address past the range.
        end: u32,
    },
}

impl ScanRegion {
    /// Creates a new `ScanRegion` that scans the given memory range.
    pub fn range(range: Range<u32>) -> Self {
        Self::Range {
            start: range.start,
            end: range.end,
        }
    }
}

/// Parse a [`ScanRegion`] from either an exact address `0x2000_0000` or a range
/// `0x2000_0000..0x2001_0000`. Both decimal and hex are accepted.
pub fn parse_scan_region(
    mut src: &str,
) -> Result<ScanRegion, Box<dyn std::error::Error + Send + Sync + 'static>> {
    src = src.trim();

    let parts = src
        .split("..")
        .map(|p| {
            let p = p.trim().replace('_', "");
            if let Some(hex) = p.strip_prefix("0x").or_else(|| p.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16)
            } else {
                p.parse()
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    match *parts.as_slice() {
        [addr] => Ok(ScanRegion::Exact(addr)),
        [start, end] => Ok(ScanRegion::range(start..end)),
        _ => Err("Invalid range: multiple '..'s".into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::MockProbe;
    use pretty_assertions::assert_eq;

    const CB: u32 = 0x2000_0000;

    fn target_with_channels() -> MockProbe {
        let mut probe = MockProbe::new();
        probe.add_control_block(CB, 3, 1);
        probe.add_descriptor(
            CB,
            0,
            &BufferDescriptor {
                name_ptr: 0x2000_0800,
                buffer_ptr: 0x2000_1000,
                size: 1024,
                flags: 2,
                ..Default::default()
            },
        );
        // Names are read in one fixed size chunk.
        let mut name = b"Terminal\0".to_vec();
        name.resize(ControlBlock::MAX_NAME_LEN, 0xff);
        probe.add_range(0x2000_0800, name);
        probe.add_descriptor(CB, 1, &BufferDescriptor::default());
        probe.add_descriptor(
            CB,
            2,
            &BufferDescriptor {
                buffer_ptr: 0x2000_2000,
                size: 64,
                ..Default::default()
            },
        );
        probe
    }

    #[test]
    fn attach_exact() {
        let mut probe = target_with_channels();
        let cb = ControlBlock::attach(&mut probe, &ScanRegion::Exact(CB)).unwrap();

        assert_eq!(cb.ptr(), CB);
        assert_eq!(cb.max_up_channels(), 3);
        assert_eq!(cb.max_down_channels(), 1);
        assert_eq!(cb.up_descriptor_address(1).unwrap(), CB + 48);
    }

    #[test]
    fn attach_scans_range() {
        let mut probe = MockProbe::new();
        probe.add_range(0x2000_0000, vec![0xaa; 0x40]);
        probe.add_control_block(0x2000_0040, 1, 0);
        probe.add_range(0x2000_0058, vec![0x55; 0x28]);

        let region = ScanRegion::range(0x2000_0000..0x2000_0080);
        let cb = ControlBlock::attach(&mut probe, &region).unwrap();

        assert_eq!(cb.ptr(), 0x2000_0040);
    }

    #[test]
    fn oversized_scan_range_is_rejected() {
        let mut probe = MockProbe::new();
        let region = ScanRegion::range(0x2000_0000..0x2100_0000);

        let result = ControlBlock::attach(&mut probe, &region);

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(probe.operations().is_empty());
    }

    #[test]
    fn wrong_id_is_not_a_control_block() {
        let mut probe = MockProbe::new();
        probe.add_range(CB, vec![0; ControlBlock::HEADER_SIZE]);

        let result = ControlBlock::attach(&mut probe, &ScanRegion::Exact(CB));

        assert!(matches!(result, Err(Error::ControlBlockNotFound)));
    }

    #[test]
    fn nonsensical_channel_count() {
        let mut probe = MockProbe::new();
        probe.add_control_block(CB, 0x1000, 1);

        let result = ControlBlock::attach(&mut probe, &ScanRegion::Exact(CB));

        assert!(matches!(result, Err(Error::ControlBlockCorrupted(_))));
    }

    #[test]
    fn missing_channel() {
        let mut probe = target_with_channels();
        let cb = ControlBlock::attach_at(&mut probe, CB).unwrap();

        assert!(matches!(
            cb.read_up_descriptor(&mut probe, 3),
            Err(Error::MissingChannel(3))
        ));
    }

    #[test]
    fn enumerate_up_channels() {
        let mut probe = target_with_channels();
        let cb = ControlBlock::attach_at(&mut probe, CB).unwrap();

        let channels = cb.up_channels(&mut probe).unwrap();

        assert_eq!(
            channels,
            vec![
                ChannelInfo {
                    number: 0,
                    name: Some("Terminal".to_string()),
                    buffer_size: 1024,
                    mode: Some(ChannelMode::BlockIfFull),
                },
                ChannelInfo {
                    number: 2,
                    name: None,
                    buffer_size: 64,
                    mode: Some(ChannelMode::NoBlockSkip),
                },
            ]
        );
        assert_eq!(channels[0].to_string(), "0: Terminal (buffer size 1024)");
    }

    #[test]
    fn unreadable_name_does_not_hide_other_channels() {
        let mut target = MockProbe::new();
        target.add_control_block(CB, 2, 0);
        // The name sits in the last bytes of a flash region, the fixed size read runs past it.
        target.add_range(0x0800_0ffc, b"Ab\0\0".to_vec());
        target.add_descriptor(
            CB,
            0,
            &BufferDescriptor {
                name_ptr: 0x0800_0ffc,
                buffer_ptr: 0x2000_1000,
                size: 256,
                ..Default::default()
            },
        );
        target.add_descriptor(
            CB,
            1,
            &BufferDescriptor {
                buffer_ptr: 0x2000_2000,
                size: 64,
                flags: 1,
                ..Default::default()
            },
        );
        let cb = ControlBlock::attach_at(&mut target, CB).unwrap();

        let channels = cb.up_channels(&mut target).unwrap();

        assert_eq!(
            channels,
            vec![
                ChannelInfo {
                    number: 0,
                    name: None,
                    buffer_size: 256,
                    mode: Some(ChannelMode::NoBlockSkip),
                },
                ChannelInfo {
                    number: 1,
                    name: None,
                    buffer_size: 64,
                    mode: Some(ChannelMode::NoBlockTrim),
                },
            ]
        );
        assert_eq!(channels[0].to_string(), "0: (no name) (buffer size 256)");
    }

    #[test]
    fn parse_regions() {
        assert_eq!(
            parse_scan_region("0x2000_0000").unwrap(),
            ScanRegion::Exact(0x2000_0000)
        );
        assert_eq!(
            parse_scan_region("4096..0X2000").unwrap(),
            ScanRegion::range(0x1000..0x2000)
        );
        assert!(parse_scan_region("1..2..3").is_err());
        assert!(parse_scan_region("").is_err());
    }
}
