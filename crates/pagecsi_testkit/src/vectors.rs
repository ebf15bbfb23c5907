//! Known-answer test vectors.
//!
//! CRC32C vectors pin the checksum to the Castagnoli polynomial; tag header
//! vectors pin the on-disk layout for little-endian hosts.

/// A known-answer test vector.
#[derive(Debug, Clone)]
pub struct TestVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Input data (hex-encoded).
    pub input_hex: String,
    /// Expected output data (hex-encoded).
    pub expected_hex: String,
}

impl TestVector {
    /// Decodes the input bytes.
    pub fn input(&self) -> Vec<u8> {
        decode_hex(&self.input_hex)
    }

    /// Decodes the expected bytes.
    pub fn expected(&self) -> Vec<u8> {
        decode_hex(&self.expected_hex)
    }
}

/// Encodes bytes as lowercase hex.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes lowercase or uppercase hex. Panics on malformed input.
pub fn decode_hex(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "odd-length hex string");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("invalid hex digit"))
        .collect()
}

fn repeat_hex(byte: u8, n: usize) -> String {
    encode_hex(&vec![byte; n])
}

/// CRC32C vectors. Expected values are big-endian checksums.
pub fn crc32c_vectors() -> Vec<TestVector> {
    vec![
        TestVector {
            id: "crc_empty".into(),
            description: "Empty input".into(),
            input_hex: String::new(),
            expected_hex: "00000000".into(),
        },
        TestVector {
            id: "crc_check".into(),
            description: "Standard check string \"123456789\"".into(),
            input_hex: encode_hex(b"123456789"),
            expected_hex: "e3069283".into(),
        },
        TestVector {
            id: "crc_zeros_32".into(),
            description: "32 zero bytes".into(),
            input_hex: repeat_hex(0x00, 32),
            expected_hex: "8a9136aa".into(),
        },
        TestVector {
            id: "crc_ones_32".into(),
            description: "32 bytes of 0xff".into(),
            input_hex: repeat_hex(0xff, 32),
            expected_hex: "62a8ab43".into(),
        },
        TestVector {
            id: "crc_ascending_32".into(),
            description: "Bytes 0x00 to 0x1f".into(),
            input_hex: encode_hex(&(0u8..32).collect::<Vec<_>>()),
            expected_hex: "46dd794e".into(),
        },
        TestVector {
            id: "crc_descending_32".into(),
            description: "Bytes 0x1f down to 0x00".into(),
            input_hex: encode_hex(&(0u8..32).rev().collect::<Vec<_>>()),
            expected_hex: "113fdb5c".into(),
        },
    ]
}

/// Tag header vectors as written by a little-endian host.
///
/// Inputs are `tracked_len` (8 bytes, big-endian) followed by `flags`
/// (4 bytes, big-endian). Expected values are the first 16 header bytes;
/// the header checksum is the CRC32C of those.
pub fn tag_header_vectors() -> Vec<TestVector> {
    vec![
        TestVector {
            id: "header_new_empty".into(),
            description: "Fresh tag file for an empty data file".into(),
            input_hex: "0000000000000000".to_string() + "00000001",
            expected_hex: "52445430".to_string() + "0000000000000000" + "01000000",
        },
        TestVector {
            id: "header_unverified".into(),
            description: "Tracked length 10000, not verified".into(),
            input_hex: "0000000000002710".to_string() + "00000000",
            expected_hex: "52445430".to_string() + "1027000000000000" + "00000000",
        },
        TestVector {
            id: "header_large".into(),
            description: "Tracked length above 4 GiB".into(),
            input_hex: "0000000100000001".to_string() + "00000000",
            expected_hex: "52445430".to_string() + "0100000001000000" + "00000000",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecsi_core::crc::{combine, crc32c, split1, split2};
    use pagecsi_core::TagHeader;

    #[test]
    fn hex_round_trip() {
        assert_eq!(encode_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(decode_hex("00AB10"), vec![0x00, 0xab, 0x10]);
    }

    #[test]
    fn crc32c_known_answers() {
        for vector in crc32c_vectors() {
            let expected = u32::from_be_bytes(vector.expected().try_into().unwrap());
            assert_eq!(crc32c(&vector.input()), expected, "{}", vector.id);
        }
    }

    #[test]
    fn combine_and_split_on_check_string() {
        let whole = crc32c(b"123456789");
        let (a, b) = (crc32c(b"1234"), crc32c(b"56789"));
        assert_eq!(combine(a, b, 5), whole);
        assert_eq!(split1(whole, b, 5), a);
        assert_eq!(split2(whole, a, 5), b);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn tag_header_layout() {
        for vector in tag_header_vectors() {
            let input = vector.input();
            let header = TagHeader {
                swapped: false,
                tracked_len: u64::from_be_bytes(input[..8].try_into().unwrap()),
                flags: u32::from_be_bytes(input[8..].try_into().unwrap()),
            };
            let encoded = header.encode();
            assert_eq!(&encoded[..16], &vector.expected()[..], "{}", vector.id);
            assert_eq!(
                u32::from_le_bytes(encoded[16..].try_into().unwrap()),
                crc32c(&encoded[..16]),
                "{}",
                vector.id
            );
            assert_eq!(TagHeader::decode(&encoded).unwrap(), Some(header));
        }
    }
}
