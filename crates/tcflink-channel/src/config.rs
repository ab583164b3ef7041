use tcflink_frame::DEFAULT_OUTPUT_CAPACITY;

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Output buffer capacity in bytes. A message that does not fit is fatal
    /// to the channel. Default: 512 KiB.
    pub output_capacity: usize,
    /// Request zero-copy binary encoding. Only used when the peer also
    /// advertises it during the handshake.
    pub zero_copy: bool,
    /// Decode JSON integers outside the 64-bit range as strings.
    pub big_num_as_string: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            zero_copy: false,
            big_num_as_string: false,
        }
    }
}
