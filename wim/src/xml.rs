//! The XML information document stored after the lookup table.
//!
//! The document is UTF-16LE with a byte-order mark, holding the archive's total byte count and
//! one `<IMAGE>` element per image. This writer produces a minimal document; richer per-image
//! detail belongs to capture front-ends, which can replace the raw bytes wholesale.

use crate::error::{Result, WimError};
use crate::header::{ResourceEntry, ResourceFlags};
use crate::ImageInfo;
use std::io::{Seek, Write};
use tracing::debug;

/// The archive's XML information, kept in memory between open and write.
#[derive(Default)]
pub(crate) struct XmlInfo {
    /// Total uncompressed bytes recorded in the document.
    pub(crate) total_bytes: u64,

    /// Raw document bytes captured when the archive was opened. Reused verbatim when an
    /// update changes no image.
    pub(crate) raw: Option<Vec<u8>>,
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

/// Renders the document for the selected images.
fn render(images: &[&ImageInfo], total_bytes: u64) -> String {
    let mut doc = String::new();
    doc.push_str("<WIM>");
    doc.push_str(&format!("<TOTALBYTES>{total_bytes}</TOTALBYTES>"));
    for (i, image) in images.iter().enumerate() {
        doc.push_str(&format!("<IMAGE INDEX=\"{}\">", i + 1));
        doc.push_str("<NAME>");
        escape_into(&image.name, &mut doc);
        doc.push_str("</NAME>");
        doc.push_str("</IMAGE>");
    }
    doc.push_str("</WIM>");
    doc
}

/// Writes the XML data at the current position and returns its header entry.
///
/// When `reuse_raw` is set and the archive was opened from a file, the original document bytes
/// are written back unchanged; this is the path taken by updates that modify no image, where
/// `total_bytes` was carried over rather than recomputed.
pub(crate) fn write_xml_data<W: Write + Seek>(
    xml: &XmlInfo,
    images: &[&ImageInfo],
    total_bytes: u64,
    reuse_raw: bool,
    out: &mut W,
) -> Result<ResourceEntry> {
    let offset = out.stream_position().map_err(WimError::Write)?;

    let bytes: Vec<u8>;
    let payload: &[u8] = match (&xml.raw, reuse_raw) {
        (Some(raw), true) => raw,
        _ => {
            let doc = render(images, total_bytes);
            let mut encoded = Vec::with_capacity(2 + doc.len() * 2);
            encoded.extend_from_slice(&0xFEFFu16.to_le_bytes());
            for unit in doc.encode_utf16() {
                encoded.extend_from_slice(&unit.to_le_bytes());
            }
            bytes = encoded;
            &bytes
        }
    };

    out.write_all(payload).map_err(WimError::Write)?;
    debug!(offset, size = payload.len(), "wrote XML data");
    Ok(ResourceEntry {
        offset,
        size: payload.len() as u64,
        original_size: payload.len() as u64,
        flags: ResourceFlags::empty(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image(name: &str) -> ImageInfo {
        ImageInfo {
            name: name.to_string(),
            metadata: 0,
            stream_refs: Vec::new(),
            modified: false,
        }
    }

    #[test]
    fn document_is_utf16le_with_bom() {
        let img = image("Base <System>");
        let mut out = Cursor::new(Vec::new());
        let entry =
            write_xml_data(&XmlInfo::default(), &[&img], 12345, false, &mut out).unwrap();

        let bytes = out.into_inner();
        assert_eq!(entry.size as usize, bytes.len());
        assert_eq!(&bytes[..2], &[0xFF, 0xFE], "little-endian BOM");

        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        let doc = String::from_utf16(&units).unwrap();
        assert!(doc.contains("<TOTALBYTES>12345</TOTALBYTES>"));
        assert!(doc.contains("<IMAGE INDEX=\"1\">"));
        assert!(doc.contains("Base &lt;System&gt;"));
    }

    #[test]
    fn raw_bytes_reused_on_request() {
        let xml = XmlInfo {
            total_bytes: 7,
            raw: Some(b"not even xml".to_vec()),
        };
        let mut out = Cursor::new(Vec::new());
        write_xml_data(&xml, &[], 7, true, &mut out).unwrap();
        assert_eq!(out.into_inner(), b"not even xml");
    }
}
