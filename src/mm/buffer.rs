use crate::error::{AccelError, AccelResult};

/// Bytes per call-stack slot.
pub const SLOT_SIZE: u64 = 8;

/// Header slots at the start of every frame, ahead of the arguments.
pub const RESERVED_SLOTS: usize = 3;

/// Header slot indices.
pub const SLOT_RETURN_VALUE: usize = 0;
pub const SLOT_DEOPT: usize = 1;
pub const SLOT_HEAP_BASE: usize = 2;

/// A view `[offset, offset + size)` into a device region, relative to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    offset: u64,
    size: u64,
}

impl Buffer {
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// A view of `bytes` bytes starting `offset` bytes into this buffer.
    ///
    /// # Errors
    /// `InvalidArgument` if the view would extend past this buffer.
    pub fn sub_buffer(&self, offset: u64, bytes: u64) -> AccelResult<Self> {
        match offset.checked_add(bytes) {
            Some(end) if end <= self.size => Ok(Self::new(self.offset + offset, bytes)),
            _ => Err(AccelError::InvalidArgument(format!(
                "sub-buffer [{offset}, +{bytes}) exceeds buffer of {} bytes",
                self.size
            ))),
        }
    }
}

/// One kernel-argument frame in the call-stack region.
///
/// The frame holds [`RESERVED_SLOTS`] header slots followed by up to
/// `max_args` argument slots, each [`SLOT_SIZE`] bytes, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    offset: u64,
    max_args: usize,
    size: u64,
    slots: Vec<u64>,
}

impl CallStack {
    /// `None` if a frame for `max_args` arguments is not addressable.
    #[must_use]
    pub fn new(offset: u64, max_args: usize) -> Option<Self> {
        let size = Self::size_for(max_args)?;
        Some(Self {
            offset,
            max_args,
            size,
            slots: vec![0; RESERVED_SLOTS],
        })
    }

    /// Frame size in bytes for `max_args` arguments, `None` on overflow.
    #[must_use]
    pub const fn size_for(max_args: usize) -> Option<u64> {
        match (max_args as u64).checked_add(RESERVED_SLOTS as u64) {
            Some(slots) => slots.checked_mul(SLOT_SIZE),
            None => None,
        }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn max_args(&self) -> usize {
        self.max_args
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.slots.len() - RESERVED_SLOTS
    }

    #[must_use]
    pub const fn buffer(&self) -> Buffer {
        Buffer::new(self.offset, self.size())
    }

    /// # Errors
    /// `InvalidArgument` once `max_args` arguments have been pushed.
    pub fn push_arg(&mut self, value: u64) -> AccelResult<()> {
        if self.arg_count() >= self.max_args {
            return Err(AccelError::InvalidArgument(format!(
                "call stack full: {} arguments",
                self.max_args
            )));
        }
        self.slots.push(value);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` if `slot` is not a header slot.
    pub fn set_header(&mut self, slot: usize, value: u64) -> AccelResult<()> {
        let Some(entry) = self.slots.get_mut(slot).filter(|_| slot < RESERVED_SLOTS) else {
            return Err(AccelError::InvalidArgument(format!(
                "header slot {slot} out of range (0..{RESERVED_SLOTS})"
            )));
        };
        *entry = value;
        Ok(())
    }

    #[must_use]
    pub fn header(&self, slot: usize) -> Option<u64> {
        (slot < RESERVED_SLOTS).then(|| self.slots[slot])
    }

    #[must_use]
    pub fn args(&self) -> &[u64] {
        &self.slots[RESERVED_SLOTS..]
    }

    /// Drops pushed arguments and zeroes the header so the frame can be reused.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.resize(RESERVED_SLOTS, 0);
    }

    /// Serialized header and pushed arguments; unused slots are not included.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.slots.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_buffer_stays_inside_parent() {
        let buf = Buffer::new(4096, 256);
        let sub = buf.sub_buffer(64, 128).unwrap();
        assert_eq!(sub, Buffer::new(4160, 128));
        assert!(sub.overlaps(&buf));
        assert!(buf.sub_buffer(200, 57).is_err());
        assert!(buf.sub_buffer(u64::MAX, 2).is_err());
    }

    #[test]
    fn call_stack_layout() {
        let mut frame = CallStack::new(256, 2).unwrap();
        assert_eq!(frame.size(), (RESERVED_SLOTS as u64 + 2) * 8);

        frame.set_header(SLOT_HEAP_BASE, 0x1000).unwrap();
        frame.push_arg(7).unwrap();
        frame.push_arg(9).unwrap();
        assert!(frame.push_arg(11).is_err());
        assert!(frame.set_header(RESERVED_SLOTS, 1).is_err());

        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), (RESERVED_SLOTS + 2) * 8);
        assert_eq!(&bytes[SLOT_HEAP_BASE * 8..SLOT_HEAP_BASE * 8 + 8], &0x1000u64.to_le_bytes());
        assert_eq!(frame.args(), &[7, 9]);

        frame.clear();
        assert_eq!(frame.arg_count(), 0);
        assert_eq!(frame.header(SLOT_HEAP_BASE), Some(0));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        assert_eq!(CallStack::size_for(4093), Some(32 * 1024));
        assert_eq!(CallStack::size_for(1 << 61), None);
        assert_eq!(CallStack::size_for(usize::MAX), None);
        assert!(CallStack::new(0, 1 << 61).is_none());
    }
}
