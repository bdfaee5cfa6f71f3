use core::fmt;
use kernel_sched::Handle;

/// Bytes of inline payload.
pub const MAX_DATA_LEN: usize = 88;

/// Handles carried by one message.
pub const MAX_HANDLES: usize = 6;

/// Size of an encoded [`Message`].
pub const MESSAGE_SIZE: usize = 24 + 8 * MAX_HANDLES + MAX_DATA_LEN;

const _: () = assert!(size_of::<Message>() == MESSAGE_SIZE);

/// One mailbox message, laid out the way user space sees it.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Message {
    /// Protocol-defined message kind.
    pub tag: u64,
    /// Set by the kernel to identify the sender.
    pub badge: u64,
    /// Non-zero while a call waits for this message to be answered.
    pub reply_tag: u16,
    _reserved: [u16; 2],
    handle_count: u8,
    data_len: u8,
    handles: [Handle; MAX_HANDLES],
    data: [u8; MAX_DATA_LEN],
}

impl Message {
    pub const EMPTY: Self = Self {
        tag: 0,
        badge: 0,
        reply_tag: 0,
        _reserved: [0; 2],
        handle_count: 0,
        data_len: 0,
        handles: [Handle(0); MAX_HANDLES],
        data: [0; MAX_DATA_LEN],
    };

    #[must_use]
    pub const fn new(tag: u64) -> Self {
        Self { tag, ..Self::EMPTY }
    }

    /// Message with `data` as payload; `None` if it does not fit.
    #[must_use]
    pub fn with_data(tag: u64, data: &[u8]) -> Option<Self> {
        let mut msg = Self::new(tag);
        msg.set_data(data).then_some(msg)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.data_len)]
    }

    /// Replace the payload. Returns `false`, leaving the message untouched,
    /// when `data` is longer than [`MAX_DATA_LEN`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_data(&mut self, data: &[u8]) -> bool {
        if data.len() > MAX_DATA_LEN {
            return false;
        }
        self.data[..data.len()].copy_from_slice(data);
        self.data[data.len()..].fill(0);
        self.data_len = data.len() as u8;
        true
    }

    #[must_use]
    pub fn handles(&self) -> &[Handle] {
        &self.handles[..usize::from(self.handle_count)]
    }

    /// Attach a handle; `false` when all slots are taken.
    pub fn push_handle(&mut self, handle: Handle) -> bool {
        let n = usize::from(self.handle_count);
        if n == MAX_HANDLES {
            return false;
        }
        self.handles[n] = handle;
        self.handle_count += 1;
        true
    }

    pub fn clear_handles(&mut self) {
        self.handles = [Handle(0); MAX_HANDLES];
        self.handle_count = 0;
    }

    /// The user-visible encoding, little-endian, same layout as the struct.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0; MESSAGE_SIZE];
        out[0..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..16].copy_from_slice(&self.badge.to_le_bytes());
        out[16..18].copy_from_slice(&self.reply_tag.to_le_bytes());
        out[22] = self.handle_count;
        out[23] = self.data_len;
        for (i, h) in self.handles.iter().enumerate() {
            out[24 + 8 * i..32 + 8 * i].copy_from_slice(&h.0.to_le_bytes());
        }
        out[24 + 8 * MAX_HANDLES..].copy_from_slice(&self.data);
        out
    }

    /// Decode what user space handed in. `None` when the counts are out of
    /// range. Unused slots and the reserved words are cleared.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; MESSAGE_SIZE]) -> Option<Self> {
        let u64_at = |at: usize| {
            let mut b = [0; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let handle_count = bytes[22];
        let data_len = bytes[23];
        if usize::from(handle_count) > MAX_HANDLES || usize::from(data_len) > MAX_DATA_LEN {
            return None;
        }

        let mut msg = Self {
            tag: u64_at(0),
            badge: u64_at(8),
            reply_tag: u16::from_le_bytes([bytes[16], bytes[17]]),
            ..Self::EMPTY
        };
        for i in 0..usize::from(handle_count) {
            msg.push_handle(Handle(u64_at(24 + 8 * i)));
        }
        let data = &bytes[24 + 8 * MAX_HANDLES..];
        msg.set_data(&data[..usize::from(data_len)]);
        Some(msg)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("tag", &self.tag)
            .field("badge", &self.badge)
            .field("reply_tag", &self.reply_tag)
            .field("handles", &self.handles())
            .field("data", &self.data())
            .finish()
    }
}
