use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

/// Expected digest of the merged output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

impl ChecksumRequest {
    /// Parses `type:hex`, e.g. `sha256:ab12...`.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let (kind, hex_digest) = value
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidInput(format!("checksum '{}' is not type:hex", value)))?;
        let checksum_type = ChecksumType::parse(kind)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown checksum type '{}'", kind)))?;
        if hex::decode(hex_digest).is_err() {
            return Err(CoreError::InvalidInput(format!("'{}' is not hex", hex_digest)));
        }
        Ok(Self {
            checksum_type,
            expected_hex: hex_digest.to_ascii_lowercase(),
        })
    }
}

pub fn file_digest(path: &Path, checksum_type: ChecksumType) -> CoreResult<String> {
    match checksum_type {
        ChecksumType::Md5 => digest_file::<Md5>(path),
        ChecksumType::Sha1 => digest_file::<Sha1>(path),
        ChecksumType::Sha256 => digest_file::<Sha256>(path),
    }
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> CoreResult<()> {
    let actual = file_digest(path, req.checksum_type)?;
    if actual.eq_ignore_ascii_case(&req.expected_hex) {
        Ok(())
    } else {
        Err(CoreError::ChecksumMismatch {
            expected: req.expected_hex.clone(),
            actual,
        })
    }
}

fn digest_file<D: Digest>(path: &Path) -> CoreResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn verifies_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let sha256 = ChecksumRequest::parse(
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        verify_checksum(&path, &sha256).unwrap();

        let md5 = ChecksumRequest::parse("MD5:5EB63BBBE01EEED093CB22BB8F5ACDC3").unwrap();
        verify_checksum(&path, &md5).unwrap();

        let wrong = ChecksumRequest::parse("sha1:00").unwrap();
        assert!(matches!(
            verify_checksum(&path, &wrong),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(ChecksumRequest::parse("sha256").is_err());
        assert!(ChecksumRequest::parse("crc32:00").is_err());
        assert!(ChecksumRequest::parse("md5:zz").is_err());
    }
}
