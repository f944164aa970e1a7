//! Exec envelope format
//!
//! Messages on the browser side of an exec session are small JSON objects:
//!
//! ```json
//! {"type": "input",  "data": "ls\n"}
//! {"type": "stdout", "data": "total 0\n"}
//! {"type": "stderr", "data": "ls: cannot access"}
//! {"type": "resize", "cols": 120, "rows": 40}
//! {"type": "error",  "data": "pod not found"}
//! ```

use serde::{Deserialize, Serialize};

use kubedeck_common::{Error, Result};

/// One envelope exchanged with the browser
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecMessage {
    /// Keystrokes for the remote process (inbound)
    Input {
        /// Raw text
        data: String,
    },
    /// Remote standard output (outbound)
    Stdout {
        /// Decoded text
        data: String,
    },
    /// Remote standard error (outbound)
    Stderr {
        /// Decoded text
        data: String,
    },
    /// Terminal size change (inbound)
    Resize {
        /// Columns
        cols: u16,
        /// Rows
        rows: u16,
    },
    /// Session failure reported before close (outbound)
    Error {
        /// Error text
        data: String,
    },
}

impl ExecMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::bridge(format!("malformed exec message: {}", e)))
    }

    /// Envelope type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Resize { .. } => "resize",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> String {
        // Enum of strings and integers, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Incremental UTF-8 decoder for remote output.
///
/// Multi-byte sequences split across reads are held back until complete;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode the next chunk, returning all text that is complete so far
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is held back at end of stream
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}
