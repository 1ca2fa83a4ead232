//! Stateful charset transcoding of path components.
//!
//! Every byte string that crosses the mount boundary goes through one of two
//! directional conversion engines: caller→storage for incoming paths,
//! storage→caller for directory entries and symlink targets going back out.
//!
//! Conversion never fails an operation. Malformed or truncated input
//! degrades to the successfully converted prefix plus a visible sentinel,
//! so the caller sees a lossy name instead of an error. Each engine works
//! through fixed-size intermediate buffers and continues across buffer-full
//! conditions, which are expected for inputs longer than the buffer.

use encoding_rs::{DecoderResult, EncoderResult, Encoding};
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Sentinel appended when input is malformed in the source encoding, ends in
/// a truncated multi-byte sequence, or contains a character the destination
/// encoding cannot represent.
pub const PARTIAL_SENTINEL: &str = "???";

/// Sentinel returned alone when conversion fails outright.
pub const FAILURE_SENTINEL: &str = "????";

/// Size of the intermediate work buffers, in bytes.
const WORK_BUF_LEN: usize = 255;

/// Hard bound on converted output. Path components are bounded by NAME_MAX
/// and full paths by PATH_MAX; anything past this is pathological input.
const MAX_OUTPUT_LEN: usize = 64 * 1024;

/// Conversion direction across the mount boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Incoming caller path, converted to the storage encoding.
    CallerToStorage,
    /// Outgoing name (directory entry, symlink target), converted to the
    /// caller encoding.
    StorageToCaller,
}

/// Looks up a charset by label, returning `None` for unknown labels and for
/// encodings without a usable encoder (the UTF-16 family, replacement).
///
/// Filenames on a native filesystem are byte strings, so an encoding that
/// cannot encode back to bytes is unusable on either side of the mount.
pub fn lookup_charset(label: &str) -> Option<&'static Encoding> {
    let enc = Encoding::for_label(label.trim().as_bytes())?;
    if enc.output_encoding() != enc {
        return None;
    }
    Some(enc)
}

/// One directional conversion engine.
///
/// Owns decoder/encoder state for its charset pair. The state is reset at
/// the start of every conversion so shift state never leaks from one path
/// to the next; it exists to carry continuation state across the bounded
/// work-buffer loop within a single conversion.
struct ConvEngine {
    src: &'static Encoding,
    dst: &'static Encoding,
}

/// Outcome of one conversion step.
enum Step {
    /// More input remains, keep going with a fresh work buffer.
    Continue,
    /// Input was malformed or truncated: flush and append the sentinel.
    Degrade,
    /// Conversion cannot proceed at all: replace output with the fallback.
    Fail,
    /// All input consumed.
    Done,
}

impl ConvEngine {
    fn new(src: &'static Encoding, dst: &'static Encoding) -> Self {
        Self { src, dst }
    }

    /// Converts `input` best-effort; always returns a byte string.
    fn convert(&mut self, input: &[u8]) -> Vec<u8> {
        if input.is_empty() {
            return Vec::new();
        }

        let mut decoder = self.src.new_decoder_without_bom_handling();
        let mut encoder = self.dst.new_encoder();
        let mut out = Vec::with_capacity(input.len());
        let mut utf8_buf = [0u8; WORK_BUF_LEN];
        let mut consumed = 0;

        loop {
            let (result, nread, nwritten) =
                decoder.decode_to_utf8_without_replacement(&input[consumed..], &mut utf8_buf, true);
            consumed += nread;

            let step = match self.encode_chunk(&mut encoder, &utf8_buf[..nwritten], &mut out) {
                Step::Continue => match result {
                    DecoderResult::InputEmpty => Step::Done,
                    DecoderResult::OutputFull => {
                        if out.len() > MAX_OUTPUT_LEN {
                            Step::Fail
                        } else {
                            Step::Continue
                        }
                    }
                    DecoderResult::Malformed(_, _) => Step::Degrade,
                },
                other => other,
            };

            match step {
                Step::Continue => {}
                Step::Done => break,
                Step::Degrade => {
                    out.extend_from_slice(PARTIAL_SENTINEL.as_bytes());
                    return out;
                }
                Step::Fail => return FAILURE_SENTINEL.as_bytes().to_vec(),
            }
        }

        match self.finish_encoder(&mut encoder, &mut out) {
            Step::Degrade => out.extend_from_slice(PARTIAL_SENTINEL.as_bytes()),
            Step::Fail => return FAILURE_SENTINEL.as_bytes().to_vec(),
            Step::Continue | Step::Done => {}
        }
        out
    }

    /// Encodes one decoded chunk into `out`, looping over the bounded
    /// destination buffer.
    fn encode_chunk(
        &self,
        encoder: &mut encoding_rs::Encoder,
        chunk: &[u8],
        out: &mut Vec<u8>,
    ) -> Step {
        // The decoder only ever hands us valid UTF-8.
        let Ok(mut text) = std::str::from_utf8(chunk) else {
            return Step::Fail;
        };
        let mut buf = [0u8; WORK_BUF_LEN];
        while !text.is_empty() {
            let (result, nread, nwritten) =
                encoder.encode_from_utf8_without_replacement(text, &mut buf, false);
            out.extend_from_slice(&buf[..nwritten]);
            text = &text[nread..];
            match result {
                EncoderResult::InputEmpty => break,
                EncoderResult::OutputFull => {
                    if out.len() > MAX_OUTPUT_LEN {
                        return Step::Fail;
                    }
                }
                EncoderResult::Unmappable(_) => return Step::Degrade,
            }
        }
        Step::Continue
    }

    /// Flushes encoder shift state at end of input.
    fn finish_encoder(&self, encoder: &mut encoding_rs::Encoder, out: &mut Vec<u8>) -> Step {
        let mut buf = [0u8; WORK_BUF_LEN];
        loop {
            let (result, _, nwritten) =
                encoder.encode_from_utf8_without_replacement("", &mut buf, true);
            out.extend_from_slice(&buf[..nwritten]);
            match result {
                EncoderResult::InputEmpty => return Step::Done,
                EncoderResult::OutputFull => {
                    if out.len() > MAX_OUTPUT_LEN {
                        return Step::Fail;
                    }
                }
                EncoderResult::Unmappable(_) => return Step::Degrade,
            }
        }
    }
}

/// Process-wide transcoder holding both directional engines.
///
/// The engines carry mutable conversion state, so each is serialized behind
/// its own lock; conversions are short relative to the native I/O they
/// precede, so a plain mutex per direction is sufficient.
pub struct Transcoder {
    caller_to_storage: Mutex<ConvEngine>,
    storage_to_caller: Mutex<ConvEngine>,
}

impl Transcoder {
    /// Creates a transcoder for the given charset pair.
    ///
    /// `storage` is the charset of names in the backing directory tree,
    /// `caller` the charset presented on the mounted filesystem.
    pub fn new(storage: &'static Encoding, caller: &'static Encoding) -> Self {
        Self {
            caller_to_storage: Mutex::new(ConvEngine::new(caller, storage)),
            storage_to_caller: Mutex::new(ConvEngine::new(storage, caller)),
        }
    }

    /// Converts a byte string across the mount boundary.
    pub fn convert(&self, direction: Direction, input: &[u8]) -> Vec<u8> {
        let engine = match direction {
            Direction::CallerToStorage => &self.caller_to_storage,
            Direction::StorageToCaller => &self.storage_to_caller,
        };
        engine.lock().convert(input)
    }

    /// Converts an incoming caller path to the storage encoding.
    pub fn caller_to_storage(&self, name: &OsStr) -> OsString {
        OsString::from_vec(self.convert(Direction::CallerToStorage, name.as_bytes()))
    }

    /// Converts an outgoing storage-side name to the caller encoding.
    pub fn storage_to_caller(&self, name: &OsStr) -> OsString {
        OsString::from_vec(self.convert(Direction::StorageToCaller, name.as_bytes()))
    }
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder").finish_non_exhaustive()
    }
}
