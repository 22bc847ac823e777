//! Timeout tokens sent from host to guest over the console control channel.

/// Escalation request delivered while the guest waits on a foreground command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Ask the running command to terminate gracefully.
    Soft,
    /// Stop waiting; the guest powers off.
    Hard,
}

impl ControlToken {
    /// Wire form. Each token is a full line so a canonical-mode console
    /// delivers it without waiting for more input.
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Soft => b"s\n",
            Self::Hard => b"h\n",
        }
    }

    /// Classifies the first byte of a control read.
    ///
    /// Anything other than the hard token counts as soft: any byte at all
    /// means the host's deadline has passed.
    pub const fn from_byte(b: u8) -> Self {
        match b {
            b'h' => Self::Hard,
            _ => Self::Soft,
        }
    }

    /// Classifies one read from the control channel.
    ///
    /// Line terminators carry no meaning. Reads that coalesce several tokens
    /// resolve to the strongest one; a read of only whitespace yields `None`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes
            .iter()
            .filter(|b| !b.is_ascii_whitespace())
            .map(|&b| Self::from_byte(b))
            .reduce(|a, b| if matches!(b, Self::Hard) { b } else { a })
    }
}
