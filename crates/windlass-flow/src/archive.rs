//! Vendor archive packing and unpacking.
//!
//! Windows arrive as gzip-compressed tar archives. Extraction walks the
//! archive entry by entry so memory stays bounded by the largest member,
//! not the whole archive.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// One file extracted from a window archive.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Member name with directories flattened to the base name.
    pub name: String,
    /// Member contents.
    pub data: Bytes,
}

/// Unpacks a `.tar.gz` window archive.
///
/// Directory members are skipped; file members keep only their base name
/// (the staged window prefix is flat).
///
/// # Errors
///
/// Returns `Error::Archive` if the archive is corrupt.
pub fn unpack_window(archive: &[u8]) -> Result<Vec<ExtractedFile>> {
    let decoder = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);
    let mut files = Vec::new();

    let entries = tar
        .entries()
        .map_err(|e| Error::Archive {
            message: format!("read tar entries: {e}"),
        })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Archive {
            message: format!("read tar entry: {e}"),
        })?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = {
            let path = entry.path().map_err(|e| Error::Archive {
                message: format!("tar entry path: {e}"),
            })?;
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        if name.is_empty() {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(|e| Error::Archive {
            message: format!("read tar member {name}: {e}"),
        })?;

        files.push(ExtractedFile {
            name,
            data: Bytes::from(data),
        });
    }

    Ok(files)
}

/// Packs files into a `.tar.gz` archive.
///
/// Used by scripted vendors in tests; the inverse of [`unpack_window`].
///
/// # Errors
///
/// Returns `Error::Archive` if the archive cannot be built.
pub fn pack_window(files: &[(String, Bytes)]) -> Result<Bytes> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data.as_ref())
            .map_err(|e| Error::Archive {
                message: format!("append tar member {name}: {e}"),
            })?;
    }

    let encoder = builder.into_inner().map_err(|e| Error::Archive {
        message: format!("finish tar: {e}"),
    })?;
    let compressed = encoder.finish().map_err(|e| Error::Archive {
        message: format!("finish gzip: {e}"),
    })?;
    Ok(Bytes::from(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_roundtrip() {
        let files = vec![
            ("manifest.csv".to_string(), Bytes::from("a,b\n1,2\n")),
            (
                "Object/product__v_upsert.csv".to_string(),
                Bytes::from("id,name__v\np1,Widget\n"),
            ),
        ];

        let archive = pack_window(&files).expect("pack");
        let extracted = unpack_window(&archive).expect("unpack");

        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0].name, "manifest.csv");
        // Directories flatten to the base name.
        assert_eq!(extracted[1].name, "product__v_upsert.csv");
        assert_eq!(extracted[1].data, Bytes::from("id,name__v\np1,Widget\n"));
    }

    #[test]
    fn corrupt_archive_is_rejected() {
        let err = unpack_window(b"definitely not a tarball").unwrap_err();
        assert!(matches!(err, Error::Archive { .. }));
    }
}
