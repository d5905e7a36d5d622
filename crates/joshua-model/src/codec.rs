//! DEFLATE transport codec for `compressed` ensembles.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::ModelError;

pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("write to in-memory encoder");
    encoder.finish().expect("finish in-memory encoder")
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>, ModelError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ModelError::Corrupt(format!("compressed payload did not inflate: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"the same byte sequence repeated ".repeat(64);
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decompress(b"not deflate data"),
            Err(ModelError::Corrupt(_))
        ));
    }
}
