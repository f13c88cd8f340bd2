//! Reads `.torrent` / `.magnet` descriptor files into [`LocalDrop`]s.

use std::path::Path;

use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

use super::events::{DropKind, LocalDrop};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported descriptor: {0}")]
    Unsupported(String),
    #[error("invalid magnet link: {0}")]
    Magnet(String),
    #[error("invalid torrent at byte {offset}: {reason}")]
    Torrent { offset: usize, reason: &'static str },
}

pub async fn read_drop(path: &Path) -> Result<LocalDrop, DescriptorError> {
    let kind = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .and_then(|ext| DropKind::from_extension(&ext))
        .ok_or_else(|| DescriptorError::Unsupported(path.display().to_string()))?;
    let payload = tokio::fs::read(path).await?;
    let hash = match kind {
        DropKind::Torrent => torrent_info_hash(&payload)?,
        DropKind::Magnet => {
            let text = std::str::from_utf8(&payload)
                .map_err(|_| DescriptorError::Magnet("not utf-8".into()))?;
            magnet_hash(text)?
        }
    };
    Ok(LocalDrop {
        kind,
        hash,
        size: payload.len() as u64,
        payload,
        path: path.to_path_buf(),
    })
}

/// Info hash of a magnet URI, lower-case hex.
pub fn magnet_hash(uri: &str) -> Result<String, DescriptorError> {
    let url = Url::parse(uri.trim()).map_err(|err| DescriptorError::Magnet(err.to_string()))?;
    if url.scheme() != "magnet" {
        return Err(DescriptorError::Magnet(format!(
            "unexpected scheme {}",
            url.scheme()
        )));
    }
    url.query_pairs()
        .filter(|(key, _)| key == "xt")
        .find_map(|(_, value)| {
            let lower = value.to_ascii_lowercase();
            lower.strip_prefix("urn:btih:").and_then(parse_btih)
        })
        .ok_or_else(|| DescriptorError::Magnet("missing urn:btih topic".into()))
}

fn parse_btih(value: &str) -> Option<String> {
    match value.len() {
        40 if value.bytes().all(|b| b.is_ascii_hexdigit()) => Some(value.to_ascii_lowercase()),
        32 => decode_base32(value).map(|bytes| to_hex(&bytes)),
        _ => None,
    }
}

fn decode_base32(value: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(20);
    let mut buffer: u32 = 0;
    let mut bits = 0u8;
    for ch in value.chars() {
        let ch = ch.to_ascii_uppercase();
        let digit = match ch {
            'A'..='Z' => ch as u8 - b'A',
            '2'..='7' => ch as u8 - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u32::from(digit);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    (out.len() == 20).then_some(out)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-1 of the raw bencoded `info` dictionary, lower-case hex.
pub fn torrent_info_hash(data: &[u8]) -> Result<String, DescriptorError> {
    let (start, end) = info_span(data)?;
    Ok(format!("{:x}", Sha1::digest(&data[start..end])))
}

fn info_span(data: &[u8]) -> Result<(usize, usize), DescriptorError> {
    if data.first() != Some(&b'd') {
        return Err(invalid(0, "expected top-level dictionary"));
    }
    let mut pos = 1;
    let mut span = None;
    loop {
        match data.get(pos) {
            Some(b'e') => break,
            Some(_) => {}
            None => return Err(invalid(pos, "unterminated dictionary")),
        }
        let (key, value_start) = read_bytes(data, pos)?;
        let value_end = skip_value(data, value_start)?;
        if key == b"info" {
            if data[value_start] != b'd' {
                return Err(invalid(value_start, "info is not a dictionary"));
            }
            span = Some((value_start, value_end));
        }
        pos = value_end;
    }
    span.ok_or_else(|| invalid(pos, "missing info dictionary"))
}

fn skip_value(data: &[u8], pos: usize) -> Result<usize, DescriptorError> {
    match data.get(pos) {
        Some(b'i') => {
            let end = find(data, pos + 1, b'e')?;
            Ok(end + 1)
        }
        Some(b'l') | Some(b'd') => {
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => cursor = skip_value(data, cursor)?,
                    None => return Err(invalid(cursor, "unterminated container")),
                }
            }
        }
        Some(b'0'..=b'9') => read_bytes(data, pos).map(|(_, next)| next),
        Some(_) => Err(invalid(pos, "unexpected token")),
        None => Err(invalid(pos, "unexpected end of input")),
    }
}

fn read_bytes(data: &[u8], pos: usize) -> Result<(&[u8], usize), DescriptorError> {
    let colon = find(data, pos, b':')?;
    let len: usize = std::str::from_utf8(&data[pos..colon])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| invalid(pos, "invalid string length"))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| invalid(start, "string runs past end of input"))?;
    Ok((&data[start..end], end))
}

fn find(data: &[u8], from: usize, needle: u8) -> Result<usize, DescriptorError> {
    data.get(from..)
        .and_then(|rest| rest.iter().position(|b| *b == needle))
        .map(|offset| from + offset)
        .ok_or_else(|| invalid(from, "missing delimiter"))
}

fn invalid(offset: usize, reason: &'static str) -> DescriptorError {
    DescriptorError::Torrent { offset, reason }
}
