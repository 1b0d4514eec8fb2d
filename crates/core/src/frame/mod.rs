use std::{fmt, ops::Deref};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

/// One delivered unit of pipeline output.
///
/// The bytes are copied out of the framework's buffer at the moment of receipt
/// and never mutated afterwards. Cloning shares the same immutable storage.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct FrameBuffer {
    data: Bytes,
}

impl FrameBuffer {
    /// Copies `data` into a new frame. The source slice may be released as
    /// soon as this returns.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Encodes the frame as a `data:` URL, e.g. for `image/jpeg` payloads.
    pub fn to_data_url(&self, mime: &str) -> String {
        format!("data:{mime};base64,{}", STANDARD.encode(&self.data))
    }
}

impl From<Vec<u8>> for FrameBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(value),
        }
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for FrameBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
