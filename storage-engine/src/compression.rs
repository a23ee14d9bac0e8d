use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use shared::{Error, Result};
use std::io::{Read, Write};

/// Gzip-compress a cache payload.
pub fn compress(data: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|err| Error::Codec(format!("compress: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| Error::Codec(format!("compress: {err}")))?;
    Ok(Bytes::from(compressed))
}

pub fn decompress(data: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|err| Error::Codec(format!("decompress: {err}")))?;
    Ok(Bytes::from(raw))
}
