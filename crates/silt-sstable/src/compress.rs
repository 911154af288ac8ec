use crate::error::{TableError, TableResult};


/// On-disk block compression. The discriminants are the type byte written in
/// each block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    None   = 0,
    #[default]
    Snappy = 1,
}

impl Compression {
    #[must_use]
    pub const fn type_byte(self) -> u8 {
        self as u8
    }

    /// Compress `input` into `output` (which is cleared first).
    ///
    /// A Snappy block that would not shrink by at least 12.5% is stored
    /// uncompressed instead; the returned `Compression` says which encoding
    /// was actually used and belongs in the block trailer.
    pub fn encode_into(self, input: &[u8], output: &mut Vec<u8>) -> TableResult<Self> {
        output.clear();
        match self {
            Self::None => {
                output.extend_from_slice(input);
                Ok(Self::None)
            }
            Self::Snappy => {
                output.resize(snap::raw::max_compress_len(input.len()), 0);
                let compressed_len = snap::raw::Encoder::new()
                    .compress(input, output)
                    .map_err(|err| TableError::corruption(format!("snappy: {err}")))?;

                if compressed_len >= input.len() - input.len() / 8 {
                    output.clear();
                    output.extend_from_slice(input);
                    Ok(Self::None)
                } else {
                    output.truncate(compressed_len);
                    Ok(Self::Snappy)
                }
            }
        }
    }

    /// Decompress a block stored with the trailer type byte `type_byte`.
    pub fn decode_into(type_byte: u8, input: &[u8], output: &mut Vec<u8>) -> TableResult<()> {
        output.clear();
        match type_byte {
            0 => {
                output.extend_from_slice(input);
                Ok(())
            }
            1 => {
                let decompressed_len = snap::raw::decompress_len(input)
                    .map_err(|err| TableError::corruption(format!("snappy: {err}")))?;
                output.resize(decompressed_len, 0);
                snap::raw::Decoder::new()
                    .decompress(input, output)
                    .map_err(|err| TableError::corruption(format!("snappy: {err}")))?;
                Ok(())
            }
            unknown => Err(TableError::corruption(format!(
                "unknown block compression type {unknown}",
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snappy_round_trips() {
        let input: Vec<u8> = b"the quick brown fox ".repeat(100);
        let mut compressed = Vec::new();
        let used = Compression::Snappy.encode_into(&input, &mut compressed).unwrap();
        assert_eq!(used, Compression::Snappy);
        assert!(compressed.len() < input.len());

        let mut decompressed = Vec::new();
        Compression::decode_into(used.type_byte(), &compressed, &mut decompressed).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn incompressible_input_falls_back_to_plain() {
        // High-entropy-ish bytes that Snappy cannot shrink.
        let input: Vec<u8> = (0..=255_u8).cycle().take(64).scan(7_u8, |state, byte| {
            *state = state.wrapping_mul(31).wrapping_add(byte);
            Some(*state)
        }).collect();

        let mut output = Vec::new();
        let used = Compression::Snappy.encode_into(&input, &mut output).unwrap();
        assert_eq!(used, Compression::None);
        assert_eq!(output, input);
    }

    #[test]
    fn unknown_type_byte_is_corruption() {
        let mut output = Vec::new();
        assert!(matches!(
            Compression::decode_into(7, b"data", &mut output),
            Err(TableError::Corruption(_)),
        ));
    }
}
