// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming multi-digest hasher (C2). Absorbs every byte that flows from
//! source to destination exactly once, so the computed digests are an
//! honest description of what the destination actually received rather
//! than a second read of the source.

use crc32fast::Hasher as Crc32Hasher;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

/// A snapshot of the running digests at some point in the stream. Cheap
/// to clone; holds only hex strings and a byte count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestSnapshot {
    pub md5_hex: String,
    pub sha1_hex: String,
    pub sha256_hex: String,
    pub crc32_hex: String,
    pub bytes_seen: u64,
}

/// Fans every `absorb`ed chunk out to four running digests. `absorb` is
/// synchronous and infallible (digest updates cannot fail); callers tee
/// this alongside the destination write so both see the same bytes in
/// the same order.
pub struct StreamingHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    crc32: Crc32Hasher,
    bytes_seen: u64,
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            crc32: Crc32Hasher::new(),
            bytes_seen: 0,
        }
    }

    pub fn absorb(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.crc32.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn snapshot(&self) -> DigestSnapshot {
        DigestSnapshot {
            md5_hex: hex::encode(self.md5.clone().finalize()),
            sha1_hex: hex::encode(self.sha1.clone().finalize()),
            sha256_hex: hex::encode(self.sha256.clone().finalize()),
            crc32_hex: format!("{:08x}", self.crc32.clone().finalize()),
            bytes_seen: self.bytes_seen,
        }
    }
}

/// The well-known MD5 of the empty byte string, used as the expected
/// ETag for zero-byte objects (spec §4.7 tie-break).
pub const EMPTY_OBJECT_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn empty_input_matches_well_known_empty_md5() {
        let hasher = StreamingHasher::new();
        let snapshot = hasher.snapshot();
        assert_eq!(snapshot.md5_hex, EMPTY_OBJECT_MD5);
        assert_eq!(snapshot.bytes_seen, 0);
    }

    #[test]
    fn absorbing_in_chunks_matches_absorbing_whole() {
        let mut chunked = StreamingHasher::new();
        chunked.absorb(b"hello, ");
        chunked.absorb(b"world");

        let mut whole = StreamingHasher::new();
        whole.absorb(b"hello, world");

        assert_eq!(chunked.snapshot(), whole.snapshot());
    }

    #[test]
    fn byte_count_tracks_total_absorbed() {
        let mut hasher = StreamingHasher::new();
        hasher.absorb(&[0u8; 100]);
        hasher.absorb(&[0u8; 50]);
        assert_eq!(hasher.snapshot().bytes_seen, 150);
    }
}
