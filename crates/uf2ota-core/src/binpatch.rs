use crate::block::UF2_DATA_SIZE;
use crate::Uf2OtaError;
use log::warn;

/// Overwrites selected 32-bit words; the only opcode defined so far.
pub const OPCODE_DIFF32: u8 = 0xFE;

const DIFF32_PAIR_SIZE: usize = 6; // offset:u16 + value:u32

/// Applies a binary patch to a block's data area, in place.
///
/// The patch is a sequence of records `{opcode, count, args...}`.
/// `DIFF32` args are `count` pairs of `(offset_u16_le, value_u32_le)`;
/// each pair overwrites the word at `data[offset..offset + 4]`.
/// Unknown opcodes and truncated records reject the whole block.
pub fn apply(data: &mut [u8; UF2_DATA_SIZE], patch: &[u8]) -> Result<(), Uf2OtaError> {
    let mut pos = 0;
    while pos < patch.len() {
        if pos + 2 > patch.len() {
            warn!("truncated binpatch record header at {pos}");
            return Err(Uf2OtaError::WriteFailed);
        }
        let opcode = patch[pos];
        let count = patch[pos + 1] as usize;
        pos += 2;

        match opcode {
            OPCODE_DIFF32 => {
                let end = pos + count * DIFF32_PAIR_SIZE;
                if end > patch.len() {
                    warn!("truncated DIFF32 record ({count} pairs claimed)");
                    return Err(Uf2OtaError::WriteFailed);
                }
                for pair in patch[pos..end].chunks_exact(DIFF32_PAIR_SIZE) {
                    let offset = u16::from_le_bytes([pair[0], pair[1]]) as usize;
                    if offset + 4 > UF2_DATA_SIZE {
                        warn!("DIFF32 offset {offset} out of bounds");
                        return Err(Uf2OtaError::WriteFailed);
                    }
                    data[offset..offset + 4].copy_from_slice(&pair[2..6]);
                }
                pos = end;
            }
            other => {
                warn!("unknown binpatch opcode {other:#04x}");
                return Err(Uf2OtaError::WriteFailed);
            }
        }
    }
    Ok(())
}

/// Builds a `DIFF32` patch turning `primary` into `secondary`, for the
/// package builder. Both slices must have equal length and be word
/// counts within one block. Returns an empty patch for identical input.
pub fn diff32(primary: &[u8], secondary: &[u8]) -> Result<Vec<u8>, Uf2OtaError> {
    assert_eq!(primary.len(), secondary.len());
    assert!(secondary.len() <= UF2_DATA_SIZE);

    let mut pairs = Vec::new();
    for (offset, (old, new)) in primary
        .chunks(4)
        .zip(secondary.chunks(4))
        .enumerate()
        .map(|(i, words)| (i * 4, words))
    {
        if old != new {
            // partial trailing words cannot be patched as a 32-bit diff
            if new.len() < 4 {
                return Err(Uf2OtaError::DataTooLong);
            }
            pairs.push((offset as u16, new));
        }
    }

    let mut out = Vec::new();
    // the pair count lives in one byte
    for chunk in pairs.chunks(255) {
        out.push(OPCODE_DIFF32);
        out.push(chunk.len() as u8);
        for (offset, value) in chunk {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(*value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff32_record(pairs: &[(u16, u32)]) -> Vec<u8> {
        let mut out = vec![OPCODE_DIFF32, pairs.len() as u8];
        for (offset, value) in pairs {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    #[test]
    fn diff32_overwrites_words() {
        let mut data = [0u8; UF2_DATA_SIZE];
        let patch = diff32_record(&[(4, 0xDEADBEEF), (8, 0x01020304)]);
        apply(&mut data, &patch).unwrap();
        assert_eq!(&data[4..8], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&data[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert!(data[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn offset_472_is_the_last_valid_one() {
        let mut data = [0u8; UF2_DATA_SIZE];
        apply(&mut data, &diff32_record(&[(472, 1)])).unwrap();
        assert_eq!(
            apply(&mut data, &diff32_record(&[(473, 1)])),
            Err(Uf2OtaError::WriteFailed)
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut data = [0u8; UF2_DATA_SIZE];
        assert_eq!(
            apply(&mut data, &[0x01, 0x00]),
            Err(Uf2OtaError::WriteFailed)
        );
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut data = [0u8; UF2_DATA_SIZE];
        assert_eq!(
            apply(&mut data, &[OPCODE_DIFF32, 2, 0, 0, 1, 2, 3, 4]),
            Err(Uf2OtaError::WriteFailed)
        );
        assert_eq!(apply(&mut data, &[OPCODE_DIFF32]), Err(Uf2OtaError::WriteFailed));
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let mut data = [7u8; UF2_DATA_SIZE];
        apply(&mut data, &[]).unwrap();
        assert_eq!(data, [7u8; UF2_DATA_SIZE]);
    }

    #[test]
    fn diff_then_apply_restores_secondary() {
        let mut primary = vec![0u8; 256];
        let mut secondary = vec![0u8; 256];
        for i in 0..256 {
            primary[i] = i as u8;
            secondary[i] = i as u8;
        }
        secondary[16..20].copy_from_slice(&0xCAFEF00Du32.to_le_bytes());
        secondary[200..204].copy_from_slice(&0x11223344u32.to_le_bytes());

        let patch = diff32(&primary, &secondary).unwrap();
        let mut data = [0u8; UF2_DATA_SIZE];
        data[..256].copy_from_slice(&primary);
        apply(&mut data, &patch).unwrap();
        assert_eq!(&data[..256], &secondary[..]);
    }

    #[test]
    fn identical_images_produce_an_empty_patch() {
        let image = vec![0xAB; 128];
        assert!(diff32(&image, &image).unwrap().is_empty());
    }
}
