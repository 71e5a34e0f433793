//! Content digests and magic-byte type detection
//!
//! Classification only ever looks at the leading bytes of a file; client
//! supplied MIME types and file extensions are never consulted.

use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;
const SNIFF_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

impl ImageType {
    pub fn mime(self) -> &'static str {
        match self {
            ImageType::Jpeg => "image/jpeg",
            ImageType::Png => "image/png",
            ImageType::Gif => "image/gif",
            ImageType::Webp => "image/webp",
            ImageType::Bmp => "image/bmp",
            ImageType::Tiff => "image/tiff",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageType::Jpeg => "jpg",
            ImageType::Png => "png",
            ImageType::Gif => "gif",
            ImageType::Webp => "webp",
            ImageType::Bmp => "bmp",
            ImageType::Tiff => "tiff",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        SIGNATURES
            .iter()
            .map(|(kind, _)| *kind)
            .find(|kind| kind.mime().eq_ignore_ascii_case(mime))
    }

    /// Types accepted for upload. BMP and TIFF are recognised but rejected.
    pub fn is_web_safe(self) -> bool {
        matches!(
            self,
            ImageType::Jpeg | ImageType::Png | ImageType::Gif | ImageType::Webp
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Sig {
    Byte(u8),
    Either(u8, u8),
    Any,
}

use Sig::{Any, Byte, Either};

// Checked in order; the first full match wins.
const SIGNATURES: &[(ImageType, &[Sig])] = &[
    (ImageType::Jpeg, &[Byte(0xFF), Byte(0xD8), Byte(0xFF)]),
    (
        ImageType::Png,
        &[
            Byte(0x89),
            Byte(0x50),
            Byte(0x4E),
            Byte(0x47),
            Byte(0x0D),
            Byte(0x0A),
            Byte(0x1A),
            Byte(0x0A),
        ],
    ),
    (
        ImageType::Gif,
        &[
            Byte(0x47),
            Byte(0x49),
            Byte(0x46),
            Byte(0x38),
            Either(0x37, 0x39),
            Byte(0x61),
        ],
    ),
    (
        ImageType::Webp,
        &[
            Byte(0x52),
            Byte(0x49),
            Byte(0x46),
            Byte(0x46),
            Any,
            Any,
            Any,
            Any,
            Byte(0x57),
            Byte(0x45),
            Byte(0x42),
            Byte(0x50),
        ],
    ),
    (ImageType::Bmp, &[Byte(0x42), Byte(0x4D)]),
    (ImageType::Tiff, &[Byte(0x49), Byte(0x49), Byte(0x2A), Byte(0x00)]),
    (ImageType::Tiff, &[Byte(0x4D), Byte(0x4D), Byte(0x00), Byte(0x2A)]),
];

fn matches(signature: &[Sig], bytes: &[u8]) -> bool {
    bytes.len() >= signature.len()
        && signature.iter().zip(bytes).all(|(sig, byte)| match *sig {
            Byte(expected) => *byte == expected,
            Either(a, b) => *byte == a || *byte == b,
            Any => true,
        })
}

/// Classify a byte prefix against the signature table.
pub fn classify(bytes: &[u8]) -> Option<ImageType> {
    SIGNATURES
        .iter()
        .find(|(_, signature)| matches(signature, bytes))
        .map(|(kind, _)| *kind)
}

/// Read the leading bytes of `path` and classify them.
pub async fn sniff_type(path: &Path) -> Result<Option<ImageType>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; SNIFF_LEN];
    let mut filled = 0;

    while filled < SNIFF_LEN {
        let read = file.read(&mut head[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    Ok(classify(&head[..filled]))
}

/// Hex-encoded SHA-256 of the full contents of `path`.
pub async fn digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detect_jpeg() {
        assert_eq!(classify(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageType::Jpeg));
    }

    #[test]
    fn test_detect_png() {
        assert_eq!(
            classify(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
            Some(ImageType::Png)
        );
        // Truncated signature is not enough.
        assert_eq!(classify(&[0x89, 0x50, 0x4E, 0x47]), None);
    }

    #[test]
    fn test_detect_both_gif_versions() {
        assert_eq!(
            classify(&[0x47, 0x49, 0x46, 0x38, 0x37, 0x61]),
            Some(ImageType::Gif)
        );
        assert_eq!(
            classify(&[0x47, 0x49, 0x46, 0x38, 0x39, 0x61]),
            Some(ImageType::Gif)
        );
        assert_eq!(classify(&[0x47, 0x49, 0x46, 0x38, 0x38, 0x61]), None);
    }

    #[test]
    fn test_detect_webp() {
        assert_eq!(
            classify(&[0x52, 0x49, 0x46, 0x46, 0x10, 0x20, 0x00, 0x00, 0x57, 0x45, 0x42, 0x50]),
            Some(ImageType::Webp)
        );
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(classify(b"plain text, not an image"), None);
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn test_mime_lookup() {
        assert_eq!(ImageType::from_mime("image/PNG"), Some(ImageType::Png));
        assert_eq!(ImageType::from_mime("text/html"), None);
        assert!(!ImageType::Tiff.is_web_safe());
    }

    #[tokio::test]
    async fn test_sniff_ignores_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("looks-like.png");
        std::fs::write(&path, b"#!/bin/sh\necho not an image\n").unwrap();
        assert_eq!(sniff_type(&path).await.unwrap(), None);

        let path = dir.path().join("no-extension");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xDB, 0x00]).unwrap();
        assert_eq!(sniff_type(&path).await.unwrap(), Some(ImageType::Jpeg));
    }

    #[tokio::test]
    async fn test_digest_is_content_only() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"hello").unwrap();

        let digest_a = digest(&a).await.unwrap();
        assert_eq!(digest_a, digest(&b).await.unwrap());
        assert_eq!(
            digest_a,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_digest_missing_file_is_io_error() {
        let err = digest(Path::new("/definitely/not/here")).await.unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
