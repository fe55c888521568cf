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

//! Provider classifier (C3). Decides, from an endpoint's hostname, which
//! hash a destination's ETag is authoritative over, and verifies a
//! transferred object against the locally computed digests.

use crate::hasher::DigestSnapshot;
use migrator_common::model::ProviderClass;

/// Classifies an S3-compatible endpoint by hostname substring match. Any
/// ETag containing `-` overrides this and is treated as composite
/// regardless of the endpoint (spec §4.3).
pub fn classify_endpoint(endpoint_hostname: &str) -> ProviderClass {
    let host = endpoint_hostname.to_ascii_lowercase();
    if host.contains("backblazeb2.com") {
        ProviderClass::Sha1
    } else if host.contains("amazonaws.com")
        || host.contains("minio")
        || host.contains("wasabisys.com")
        || host.contains("r2.cloudflarestorage.com")
        || host.contains("digitaloceanspaces.com")
    {
        ProviderClass::Md5SinglePart
    } else {
        ProviderClass::Md5SinglePart
    }
}

/// Strips the surrounding quotes S3-compatible providers wrap ETags in.
pub fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Refines a provider class using the actual ETag observed: a composite
/// ETag (containing `-`) is always `MultipartComposite` regardless of
/// which endpoint produced it.
pub fn refine_with_etag(class: ProviderClass, etag: &str) -> ProviderClass {
    if clean_etag(etag).contains('-') {
        ProviderClass::MultipartComposite
    } else {
        class
    }
}

/// Which locally computed digest the verification treated as
/// authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationMode {
    Md5,
    Sha1,
    CompositeMd5,
    Opaque,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub mode: VerificationMode,
    pub etag_match: bool,
    pub md5_match: bool,
    pub sha1_match: bool,
}

/// Computes the expected composite ETag for a multipart upload: MD5 of
/// the concatenated raw part MD5s, followed by `-N` (spec §4.7 step 7).
pub fn composite_etag(part_md5s: &[[u8; 16]]) -> String {
    use md5::{Digest, Md5};
    let mut concatenated = Vec::with_capacity(part_md5s.len() * 16);
    for part in part_md5s {
        concatenated.extend_from_slice(part);
    }
    let mut hasher = Md5::new();
    hasher.update(&concatenated);
    format!("{}-{}", hex::encode(hasher.finalize()), part_md5s.len())
}

/// Compares a destination ETag and the locally computed digests against
/// the provider class, producing the four match booleans and the
/// overall validity (spec §4.3, §4.7 step 7).
pub fn verify(
    dest_provider: ProviderClass,
    dest_etag: &str,
    digests: &DigestSnapshot,
    expected_composite_etag: Option<&str>,
) -> VerificationResult {
    let cleaned = clean_etag(dest_etag);

    match dest_provider {
        ProviderClass::Md5SinglePart => {
            let md5_match = cleaned.eq_ignore_ascii_case(&digests.md5_hex);
            VerificationResult {
                valid: md5_match,
                mode: VerificationMode::Md5,
                etag_match: md5_match,
                md5_match,
                sha1_match: false,
            }
        }
        ProviderClass::Sha1 => {
            let sha1_match = cleaned.eq_ignore_ascii_case(&digests.sha1_hex);
            VerificationResult {
                valid: sha1_match,
                mode: VerificationMode::Sha1,
                etag_match: sha1_match,
                md5_match: false,
                sha1_match,
            }
        }
        ProviderClass::MultipartComposite => {
            let etag_match = expected_composite_etag
                .map(|expected| cleaned.eq_ignore_ascii_case(expected))
                .unwrap_or(false);
            VerificationResult {
                valid: etag_match,
                mode: VerificationMode::CompositeMd5,
                etag_match,
                md5_match: false,
                sha1_match: false,
            }
        }
        ProviderClass::Opaque => VerificationResult {
            valid: true,
            mode: VerificationMode::Opaque,
            etag_match: false,
            md5_match: false,
            sha1_match: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn classifies_aws_and_backblaze_hosts() {
        assert_eq!(
            classify_endpoint("s3.us-east-1.amazonaws.com"),
            ProviderClass::Md5SinglePart
        );
        assert_eq!(
            classify_endpoint("s3.us-west-002.backblazeb2.com"),
            ProviderClass::Sha1
        );
    }

    #[test]
    fn composite_etag_overrides_endpoint_class() {
        let refined = refine_with_etag(ProviderClass::Md5SinglePart, "\"abc123-4\"");
        assert_eq!(refined, ProviderClass::MultipartComposite);
    }

    #[test]
    fn clean_etag_strips_quotes() {
        assert_eq!(clean_etag("\"d41d8cd98f00b204e9800998ecf8427e\""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn md5_single_part_verification_matches_on_equal_digest() {
        let digests = DigestSnapshot {
            md5_hex: "abc123".to_string(),
            sha1_hex: "unused".to_string(),
            sha256_hex: "unused".to_string(),
            crc32_hex: "unused".to_string(),
            bytes_seen: 10,
        };
        let result = verify(ProviderClass::Md5SinglePart, "\"ABC123\"", &digests, None);
        assert!(result.valid);
        assert!(result.md5_match);
        assert_eq!(result.mode, VerificationMode::Md5);
    }

    #[test]
    fn composite_verification_requires_expected_etag() {
        let digests = DigestSnapshot {
            md5_hex: "unused".to_string(),
            sha1_hex: "unused".to_string(),
            sha256_hex: "unused".to_string(),
            crc32_hex: "unused".to_string(),
            bytes_seen: 10,
        };
        let result = verify(
            ProviderClass::MultipartComposite,
            "\"deadbeef-2\"",
            &digests,
            Some("deadbeef-2"),
        );
        assert!(result.valid);
        assert!(result.etag_match);
    }
}
