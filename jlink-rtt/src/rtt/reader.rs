use std::cmp::min;

use super::{BufferDescriptor, ControlBlock};
use crate::{Error, Probe};

/// Ring buffer bookkeeping that passed validation.
///
/// Holding one proves `size > 0`, `write < size`, `read < size` and that the buffer does not
/// run past the end of the 32-bit address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingState {
    buffer_ptr: u32,
    size: u32,
    write: u32,
    read: u32,
}

impl RingState {
    /// Number of unread bytes, `(write - read) mod size`.
    ///
    /// Equal offsets mean the buffer is empty, never full.
    pub fn available(&self) -> u32 {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.size - self.read + self.write
        }
    }

    /// Splits a read of `count` bytes starting at the read offset into the part up to the end
    /// of the buffer and the part wrapping around to its start.
    pub fn spans(&self, count: u32) -> (u32, u32) {
        let count = min(count, self.available());
        let contiguous = min(count, self.size - self.read);
        (contiguous, count - contiguous)
    }

    /// The read offset after consuming `count` bytes.
    pub fn advanced_read(&self, count: u32) -> u32 {
        ((u64::from(self.read) + u64::from(count)) % u64::from(self.size)) as u32
    }

    /// Declared capacity of the ring buffer.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Write offset.
    pub fn write(&self) -> u32 {
        self.write
    }

    /// Read offset.
    pub fn read(&self) -> u32 {
        self.read
    }
}

/// Checks the target supplied bookkeeping of `descriptor` before anything is derived from it.
pub fn validate(descriptor: &BufferDescriptor) -> Result<RingState, Error> {
    let BufferDescriptor {
        buffer_ptr,
        size,
        write_offset: write,
        read_offset: read,
        ..
    } = *descriptor;

    let invalid = Error::InvalidRingState { size, write, read };

    if size == 0 || write >= size || read >= size {
        return Err(invalid);
    }

    if buffer_ptr.checked_add(size - 1).is_none() {
        return Err(invalid);
    }

    Ok(RingState {
        buffer_ptr,
        size,
        write,
        read,
    })
}

/// Result of one successful soft RTT read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Number of bytes placed at the start of the destination buffer.
    pub count: usize,

    /// `false` if the new read offset could not be written back to the target. The bytes are
    /// still valid, but the target may hand them out again on the next read.
    pub published: bool,

    /// The descriptor as read at the start of this attempt.
    pub descriptor: BufferDescriptor,
}

/// Reads the unread bytes of up channel `channel` into `buf` by walking the control block with
/// plain memory accesses.
///
/// At most `buf.len()` bytes are read. The contents of `buf` past the returned count are
/// unspecified.
pub fn read_up_channel<P: Probe + ?Sized>(
    probe: &mut P,
    control_block: &ControlBlock,
    channel: u32,
    buf: &mut [u8],
) -> Result<ReadOutcome, Error> {
    let descriptor_address = control_block.up_descriptor_address(channel)?;
    let descriptor = control_block.read_up_descriptor(probe, channel)?;

    let state = validate(&descriptor)?;

    let available = state.available();
    let capacity = u32::try_from(buf.len()).unwrap_or(u32::MAX);
    let to_read = min(available, capacity);

    tracing::trace!(
        "RTT up channel {channel}: size={} write={} read={} available={available}",
        state.size,
        state.write,
        state.read
    );

    if to_read == 0 {
        return Ok(ReadOutcome {
            count: 0,
            published: true,
            descriptor,
        });
    }

    let (first, second) = state.spans(to_read);
    let (head, tail) = buf.split_at_mut(first as usize);

    probe.read_memory(state.buffer_ptr + state.read, head)?;
    if second > 0 {
        probe.read_memory(state.buffer_ptr, &mut tail[..second as usize])?;
    }

    let new_read = state.advanced_read(to_read);
    let published = match probe.write_word_32(descriptor_address + BufferDescriptor::O_READ, new_read)
    {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                "Failed to publish read offset {new_read} for up channel {channel}, data may be delivered again: {error}"
            );
            false
        }
    };

    Ok(ReadOutcome {
        count: to_read as usize,
        published,
        descriptor,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{MockProbe, Operation};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const CB: u32 = 0x2000_0000;
    const BUFFER: u32 = 0x2000_1000;

    fn ring(size: u32, write: u32, read: u32) -> BufferDescriptor {
        BufferDescriptor {
            buffer_ptr: BUFFER,
            size,
            write_offset: write,
            read_offset: read,
            ..Default::default()
        }
    }

    fn target(desc: &BufferDescriptor, contents: &[u8]) -> (MockProbe, ControlBlock) {
        let mut probe = MockProbe::new();
        probe.add_control_block(CB, 1, 0);
        probe.add_descriptor(CB, 0, desc);
        if !contents.is_empty() {
            probe.add_range(desc.buffer_ptr, contents.to_vec());
        }
        let cb = ControlBlock::attach_at(&mut probe, CB).unwrap();
        probe.clear_operations();
        (probe, cb)
    }

    fn read_offset_of(probe: &MockProbe) -> u32 {
        probe.read_word_32(CB + ControlBlock::HEADER_SIZE as u32 + BufferDescriptor::O_READ)
    }

    #[test_case(1, 0, 0, 0; "single byte buffer")]
    #[test_case(100, 10, 90, 20; "wrapped")]
    #[test_case(100, 90, 10, 80; "contiguous")]
    #[test_case(100, 99, 0, 99; "nearly full")]
    #[test_case(100, 42, 42, 0; "equal offsets are empty")]
    #[test_case(u32::MAX, u32::MAX - 1, 0, u32::MAX - 1; "largest buffer")]
    fn available_bytes(size: u32, write: u32, read: u32, expected: u32) {
        let state = RingState {
            buffer_ptr: 0,
            size,
            write,
            read,
        };
        let available = state.available();
        assert_eq!(available, expected);
        assert!(available < size);
    }

    #[test_case(0, 0, 0; "zero size")]
    #[test_case(1024, 0xffff_ffff, 0; "write offset far out of range")]
    #[test_case(1024, 1024, 0; "write offset equals size")]
    #[test_case(1024, 0, 1024; "read offset equals size")]
    #[test_case(1024, 0, 0xffff_ffff; "read offset far out of range")]
    fn corrupted_offsets_are_rejected(size: u32, write: u32, read: u32) {
        let (mut probe, cb) = target(&ring(size, write, read), &[]);
        let mut buf = [0xeeu8; 64];

        let result = read_up_channel(&mut probe, &cb, 0, &mut buf);

        assert!(matches!(
            result,
            Err(Error::InvalidRingState { size: s, write: w, read: r }) if (s, w, r) == (size, write, read)
        ));
        // Only the descriptor was read, nothing else touched.
        assert_eq!(probe.operations().len(), 1);
        assert_eq!(buf, [0xeeu8; 64]);
    }

    #[test]
    fn buffer_at_end_of_address_space_is_rejected() {
        let desc = BufferDescriptor {
            buffer_ptr: 0xffff_ff00,
            ..ring(0x200, 0, 0)
        };
        assert!(matches!(
            validate(&desc),
            Err(Error::InvalidRingState { .. })
        ));
    }

    #[test]
    fn contiguous_read() {
        let contents: Vec<u8> = (0..100).collect();
        let (mut probe, cb) = target(&ring(100, 30, 10), &contents);
        let mut buf = [0u8; 64];

        let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();

        assert_eq!(outcome.count, 20);
        assert!(outcome.published);
        assert_eq!(&buf[..20], &contents[10..30]);
        assert_eq!(
            probe.operations()[1..].to_vec(),
            vec![
                Operation::Read {
                    address: BUFFER + 10,
                    len: 20
                },
                Operation::Write {
                    address: CB + 24 + 16,
                    value: 30
                },
            ]
        );
        assert_eq!(read_offset_of(&probe), 30);
    }

    #[test]
    fn wrapped_read_is_split_in_order() {
        let contents: Vec<u8> = (0..100).collect();
        let (mut probe, cb) = target(&ring(100, 10, 90), &contents);
        let mut buf = [0u8; 64];

        let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();

        assert_eq!(outcome.count, 20);
        let expected: Vec<u8> = (90..100).chain(0..10).collect();
        assert_eq!(&buf[..20], expected.as_slice());
        assert_eq!(
            probe.operations()[1..3].to_vec(),
            vec![
                Operation::Read {
                    address: BUFFER + 90,
                    len: 10
                },
                Operation::Read {
                    address: BUFFER,
                    len: 10
                },
            ]
        );
        assert_eq!(read_offset_of(&probe), 10);
    }

    #[test]
    fn read_is_clamped_to_destination() {
        let contents = vec![0x5a; 1024];
        let (mut probe, cb) = target(&ring(1024, 1000, 0), &contents);
        let mut buf = [0u8; 256];

        let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();

        assert_eq!(outcome.count, 256);
        assert_eq!(
            probe.operations()[1],
            Operation::Read {
                address: BUFFER,
                len: 256
            }
        );
        assert_eq!(read_offset_of(&probe), 256);
    }

    #[test]
    fn clamped_wrapped_read_stops_inside_second_span() {
        let contents: Vec<u8> = (0..100).collect();
        let (mut probe, cb) = target(&ring(100, 80, 90), &contents);
        let mut buf = [0u8; 25];

        let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();

        assert_eq!(outcome.count, 25);
        let expected: Vec<u8> = (90..100).chain(0..15).collect();
        assert_eq!(&buf[..], expected.as_slice());
        assert_eq!(read_offset_of(&probe), 15);
    }

    #[test]
    fn empty_ring_is_idempotent() {
        let (mut probe, cb) = target(&ring(100, 42, 42), &[0; 100]);
        let mut buf = [0u8; 64];

        for _ in 0..3 {
            let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();
            assert_eq!(outcome.count, 0);
            assert!(outcome.published);
        }

        assert!(probe
            .operations()
            .iter()
            .all(|op| !matches!(op, Operation::Write { .. })));
        assert_eq!(read_offset_of(&probe), 42);
    }

    #[test]
    fn failed_payload_read_is_an_error_without_write_back() {
        // No ring buffer contents mapped, so the payload read fails.
        let (mut probe, cb) = target(&ring(100, 30, 10), &[]);
        let mut buf = [0u8; 64];

        let result = read_up_channel(&mut probe, &cb, 0, &mut buf);

        assert!(matches!(
            result,
            Err(Error::ProbeIo {
                address,
                size: 20,
                ..
            }) if address == BUFFER + 10
        ));
        assert_eq!(read_offset_of(&probe), 10);
    }

    #[test]
    fn failed_write_back_still_returns_data() {
        let contents: Vec<u8> = (0..100).collect();
        let (mut probe, cb) = target(&ring(100, 30, 10), &contents);
        probe.fail_writes(true);
        let mut buf = [0u8; 64];

        let outcome = read_up_channel(&mut probe, &cb, 0, &mut buf).unwrap();

        assert_eq!(outcome.count, 20);
        assert!(!outcome.published);
        assert_eq!(&buf[..20], &contents[10..30]);
        assert_eq!(read_offset_of(&probe), 10);
    }
}
