use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// Buffer descriptors follow this layout in target memory, compatible with the official RTT
// implementation.
//
// struct Buffer {
//     const char *name; // Name of channel, pointer to null-terminated string. Optional.
//     char *buffer; // Pointer to buffer data
//     unsigned int size; // Size of data buffer. The actual capacity is one byte less.
//     unsigned int write; // Offset in data buffer of next byte to write.
//     unsigned int read; // Offset in data buffer of next byte to read.
//     // The low 2 bits of flags are used for blocking/non blocking modes, the rest are ignored.
//     unsigned int flags;
// }
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct RawBufferDescriptor {
    pub(crate) name_ptr: U32,
    pub(crate) buffer_ptr: U32,
    pub(crate) size: U32,
    pub(crate) write_offset: U32,
    pub(crate) read_offset: U32,
    pub(crate) flags: U32,
}

/// One RTT channel's ring buffer metadata, decoded from target memory.
///
/// Decoding is purely structural. Nothing here checks that the offsets are within `size`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Address of the null-terminated channel name, `0` if unnamed.
    pub name_ptr: u32,
    /// Base address of the ring buffer, `0` if the channel is unused.
    pub buffer_ptr: u32,
    /// Capacity of the ring buffer in bytes.
    pub size: u32,
    /// Offset of the next byte the target will write.
    pub write_offset: u32,
    /// Offset of the next byte the host will read.
    pub read_offset: u32,
    /// Channel flags. The low two bits hold the [`ChannelMode`].
    pub flags: u32,
}

impl BufferDescriptor {
    /// Size of a descriptor in target memory in bytes.
    pub const SIZE: usize = std::mem::size_of::<RawBufferDescriptor>();

    // Offsets of fields in target memory in bytes
    pub(crate) const O_WRITE: u32 = 12;
    pub(crate) const O_READ: u32 = 16;

    /// Decodes a descriptor from its little-endian in-memory representation.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        let raw: RawBufferDescriptor = zerocopy::transmute!(*bytes);
        Self::from(&raw)
    }

    /// Encodes the descriptor into its little-endian in-memory representation.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        zerocopy::transmute!(RawBufferDescriptor::from(self))
    }

    /// Returns `false` if the target never set this channel up.
    pub fn is_in_use(&self) -> bool {
        self.buffer_ptr != 0
    }

    /// Decodes the channel mode from the flags.
    pub fn mode(&self) -> Option<ChannelMode> {
        match self.flags & 0x3 {
            0 => Some(ChannelMode::NoBlockSkip),
            1 => Some(ChannelMode::NoBlockTrim),
            2 => Some(ChannelMode::BlockIfFull),
            _ => None,
        }
    }
}

impl From<&RawBufferDescriptor> for BufferDescriptor {
    fn from(raw: &RawBufferDescriptor) -> Self {
        Self {
            name_ptr: raw.name_ptr.get(),
            buffer_ptr: raw.buffer_ptr.get(),
            size: raw.size.get(),
            write_offset: raw.write_offset.get(),
            read_offset: raw.read_offset.get(),
            flags: raw.flags.get(),
        }
    }
}

impl From<&BufferDescriptor> for RawBufferDescriptor {
    fn from(desc: &BufferDescriptor) -> Self {
        Self {
            name_ptr: desc.name_ptr.into(),
            buffer_ptr: desc.buffer_ptr.into(),
            size: desc.size.into(),
            write_offset: desc.write_offset.into(),
            read_offset: desc.read_offset.into(),
            flags: desc.flags.into(),
        }
    }
}

/// Specifies what to do when a channel doesn't have enough buffer space for a complete write on the
/// target side.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum ChannelMode {
    /// Skip writing the data completely if it doesn't fit in its entirety.
    NoBlockSkip = 0,

    /// Write as much as possible of the data and ignore the rest.
    NoBlockTrim = 1,

    /// Block (spin) if the buffer is full. Note that if the application writes within a critical
    /// section, using this mode can cause the application to freeze if the buffer becomes full and
    /// is not read by the host.
    BlockIfFull = 2,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_pointer_and_size_fields() {
        let mut data = [0u8; BufferDescriptor::SIZE];
        data[0..4].copy_from_slice(&[0x00, 0x10, 0x00, 0x20]);
        data[4..8].copy_from_slice(&[0x00, 0x20, 0x00, 0x20]);
        data[8..12].copy_from_slice(&[0x00, 0x04, 0x00, 0x00]);

        let desc = BufferDescriptor::parse(&data);

        assert_eq!(desc.name_ptr, 0x2000_1000);
        assert_eq!(desc.buffer_ptr, 0x2000_2000);
        assert_eq!(desc.size, 1024);
        assert!(desc.is_in_use());
    }

    #[test]
    fn parse_offsets_and_flags() {
        let expected = BufferDescriptor {
            name_ptr: 0,
            buffer_ptr: 0x2000_0400,
            size: 100,
            write_offset: 10,
            read_offset: 90,
            flags: 0xffff_fff2,
        };
        let bytes = expected.to_bytes();

        let desc = BufferDescriptor::parse(&bytes);

        assert_eq!(desc, expected);
        assert_eq!(desc.mode(), Some(ChannelMode::BlockIfFull));
        assert_eq!(
            &bytes[BufferDescriptor::O_WRITE as usize..][..4],
            &10u32.to_le_bytes()
        );
        assert_eq!(
            &bytes[BufferDescriptor::O_READ as usize..][..4],
            &90u32.to_le_bytes()
        );
    }

    #[test]
    fn reserved_mode_bits() {
        let desc = BufferDescriptor {
            flags: 3,
            ..Default::default()
        };
        assert_eq!(desc.mode(), None);
        assert!(!desc.is_in_use());
    }
}
