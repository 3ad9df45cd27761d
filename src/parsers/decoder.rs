//! Incremental UTF-8 decoding across chunk boundaries.

/// Longest UTF-8 sequence; a carried fragment is always shorter than this.
const MAX_UTF8_LEN: usize = 4;

/// Decodes a byte stream into text one chunk at a time.
///
/// A multi-byte character split between two chunks is held back in
/// `pending` until the rest of it arrives. Invalid sequences decode to
/// U+FFFD, the same as `String::from_utf8_lossy`.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete trailing character carried from the last chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode `chunk`, appending the text to `out`.
    pub fn decode_into(&mut self, chunk: &[u8], out: &mut String) {
        // Finish the carried fragment one byte at a time, then decode the rest
        // of the chunk in place.
        let mut rest = chunk;
        while !self.pending.is_empty() {
            let Some((&byte, tail)) = rest.split_first() else {
                return;
            };
            rest = tail;
            self.pending.push(byte);

            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                }
                Err(err) if err.error_len().is_none() => {
                    debug_assert!(self.pending.len() < MAX_UTF8_LEN);
                }
                Err(_) => {
                    let joined = std::mem::take(&mut self.pending);
                    self.decode_bytes(&joined, out);
                }
            }
        }
        self.decode_bytes(rest, out);
    }

    /// Convenience wrapper returning the decoded text of one chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut out = String::with_capacity(chunk.len());
        self.decode_into(chunk, &mut out);
        out
    }

    /// Flush at end of stream; an unfinished character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    fn decode_bytes(&mut self, mut bytes: &[u8], out: &mut String) {
        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&bytes[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            bytes = &bytes[valid + bad..];
                        }
                        None => {
                            // Truncated sequence at the end: keep it for the next chunk.
                            self.pending.extend_from_slice(&bytes[valid..]);
                            return;
                        }
                    }
                }
            }
        }
    }
}
