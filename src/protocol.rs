//! Wire format shared by the device and the host.
//!
//! Device → host: each chunk is `N` little-endian sample words followed by a
//! three-word trailer: chunk sequence number, checksum (sum of the `N` data words
//! modulo 2^16) and a reserved zero word.
//!
//! Host → device: single command bytes, some followed by a little-endian `u16`.

use crate::led::LedChannel;

// Control commands
pub const CMD_STOP: u8 = 0xFF;
pub const CMD_LED_1: u8 = 0xFD;
pub const CMD_LED_2: u8 = 0xFE;

/// Words appended to the data words of every chunk.
pub const TRAILER_WORDS: usize = 3;

/// Bytes on the wire for a chunk carrying `buffer_size` samples.
#[inline]
pub fn chunk_len_bytes(buffer_size: usize) -> usize {
    (buffer_size + TRAILER_WORDS) * 2
}

/// Sum of `words` modulo 2^16.
#[inline]
pub fn checksum<I>(words: I) -> u16
where
    I: IntoIterator<Item = u16>,
{
    words.into_iter().fold(0u16, |acc, w| acc.wrapping_add(w))
}

/// A decoded host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    SetLedCurrent { channel: LedChannel, current: u16 },
}

impl Command {
    /// Bytes sent by the host for this command.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Command::Stop => vec![CMD_STOP],
            Command::SetLedCurrent { channel, current } => {
                let opcode = match channel {
                    LedChannel::One => CMD_LED_1,
                    LedChannel::Two => CMD_LED_2,
                };
                let [lo, hi] = current.to_le_bytes();
                vec![opcode, lo, hi]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecoderState {
    #[default]
    Idle,
    Payload {
        channel: LedChannel,
        first: Option<u8>,
    },
}

/// Incremental command decoder.
///
/// Unknown bytes are dropped without complaint; a command whose payload has not
/// arrived yet is held until it completes.
#[derive(Debug, Clone, Default)]
pub struct CommandDecoder {
    state: DecoderState,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while part of a command is buffered.
    pub fn is_pending(&self) -> bool {
        self.state != DecoderState::Idle
    }

    pub fn feed(&mut self, byte: u8) -> Option<Command> {
        match self.state {
            DecoderState::Idle => match byte {
                CMD_STOP => Some(Command::Stop),
                CMD_LED_1 => {
                    self.state = DecoderState::Payload {
                        channel: LedChannel::One,
                        first: None,
                    };
                    None
                }
                CMD_LED_2 => {
                    self.state = DecoderState::Payload {
                        channel: LedChannel::Two,
                        first: None,
                    };
                    None
                }
                _ => None,
            },
            DecoderState::Payload {
                channel,
                first: None,
            } => {
                self.state = DecoderState::Payload {
                    channel,
                    first: Some(byte),
                };
                None
            }
            DecoderState::Payload {
                channel,
                first: Some(lo),
            } => {
                self.state = DecoderState::Idle;
                Some(Command::SetLedCurrent {
                    channel,
                    current: u16::from_le_bytes([lo, byte]),
                })
            }
        }
    }
}
