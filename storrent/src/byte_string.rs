use std::fmt;

use rand::Rng;

/// A value type of exactly `N` bytes.
///
/// Used for the two 20-byte identifiers of the protocol: the info hash and
/// the peer id. Supports equality, hashing, hex formatting and uniform
/// random construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteString<const N: usize>([u8; N]);

/// SHA-1 of a torrent's bencoded info dictionary.
pub type InfoHash = ByteString<20>;
/// Opaque per-client identifier announced to trackers and peers.
pub type PeerId = ByteString<20>;

#[derive(Debug, PartialEq)]
pub struct WrongLengthError {
    pub expected: usize,
    pub actual: usize,
}

impl<const N: usize> ByteString<N> {
    pub fn new(data: [u8; N]) -> Self {
        Self(data)
    }

    pub fn random() -> Self {
        let mut data = [0u8; N];
        rand::thread_rng().fill(&mut data[..]);
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl<const N: usize> TryFrom<&[u8]> for ByteString<N> {
    type Error = WrongLengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != N {
            return Err(WrongLengthError {
                expected: N,
                actual: bytes.len(),
            });
        }
        let mut data = [0u8; N];
        data.copy_from_slice(bytes);
        Ok(Self(data))
    }
}

impl<const N: usize> fmt::Display for ByteString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl<const N: usize> fmt::Debug for ByteString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
