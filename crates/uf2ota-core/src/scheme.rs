use crate::Uf2OtaError;
use clap::ValueEnum;

/// Where an update stream may be applied: on the device itself or by an
/// external flasher, targeting the single slot or one of two dual-boot
/// slots.
///
/// The discriminant doubles as the wire position of the scheme's nibble
/// in `OTA_PART_LIST` / `OTA_PART_INFO` payloads: byte `value >> 1`,
/// high nibble for even values, low nibble for odd ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[repr(u8)]
pub enum OtaScheme {
    DeviceSingle = 0,
    DeviceDual1 = 1,
    DeviceDual2 = 2,
    FlasherSingle = 3,
    FlasherDual1 = 4,
    FlasherDual2 = 5,
}

pub const SCHEME_COUNT: usize = 6;

impl OtaScheme {
    pub const ALL: [OtaScheme; SCHEME_COUNT] = [
        OtaScheme::DeviceSingle,
        OtaScheme::DeviceDual1,
        OtaScheme::DeviceDual2,
        OtaScheme::FlasherSingle,
        OtaScheme::FlasherDual1,
        OtaScheme::FlasherDual2,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    const fn byte(self) -> usize {
        (self as usize) >> 1
    }

    const fn shift(self) -> u32 {
        if (self as u8) & 1 == 0 {
            4
        } else {
            0
        }
    }

    /// The second dual-boot slot stores a relocated image; its blocks
    /// carry binary patches that must be applied before flashing.
    pub const fn requires_binpatch(self) -> bool {
        matches!(self, OtaScheme::DeviceDual2 | OtaScheme::FlasherDual2)
    }

    /// Reads this scheme's nibble out of a scheme-indexed payload.
    pub fn nibble(self, payload: &[u8]) -> u8 {
        (payload[self.byte()] >> self.shift()) & 0xF
    }

    /// Writes this scheme's nibble into a scheme-indexed payload.
    pub fn set_nibble(self, payload: &mut [u8], value: u8) {
        debug_assert!(value <= 0xF);
        payload[self.byte()] |= value << self.shift();
    }
}

/// Checks an `OTA_PART_LIST` payload: the package must carry data for
/// the given scheme, otherwise it cannot be applied on this device.
pub fn check_part_list(scheme: OtaScheme, payload: &[u8]) -> Result<(), Uf2OtaError> {
    if payload.len() < 3 {
        return Err(Uf2OtaError::OtaWrong);
    }
    if scheme.nibble(payload) == 0 {
        return Err(Uf2OtaError::OtaWrong);
    }
    Ok(())
}

/// Resolves an `OTA_PART_INFO` payload to the partition name selected
/// for the given scheme.
///
/// The payload starts with a 3-byte nibble table (one 1-based name
/// index per scheme) followed by NUL-terminated partition names. Index
/// zero means this scheme gets no data from the following blocks, which
/// is a valid, first-class outcome (`Ok(None)`).
pub fn select_partition(scheme: OtaScheme, payload: &[u8]) -> Result<Option<&str>, Uf2OtaError> {
    if payload.len() < 3 {
        return Err(Uf2OtaError::PartitionInvalid);
    }
    let index = scheme.nibble(payload);
    if index == 0 {
        return Ok(None);
    }
    if index > SCHEME_COUNT as u8 {
        return Err(Uf2OtaError::PartitionInvalid);
    }

    let mut names = &payload[3..];
    for _ in 1..index {
        let nul = names
            .iter()
            .position(|&b| b == 0)
            .ok_or(Uf2OtaError::PartitionInvalid)?;
        if nul == 0 {
            return Err(Uf2OtaError::PartitionInvalid);
        }
        names = &names[nul + 1..];
    }
    let nul = names
        .iter()
        .position(|&b| b == 0)
        .ok_or(Uf2OtaError::PartitionInvalid)?;
    if nul == 0 {
        return Err(Uf2OtaError::PartitionInvalid);
    }
    let name = std::str::from_utf8(&names[..nul]).map_err(|_| Uf2OtaError::PartitionInvalid)?;
    Ok(Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_positions_follow_the_wire_contract() {
        let expected: [(usize, u32, bool); 6] = [
            (0, 4, false), // DeviceSingle
            (0, 0, false), // DeviceDual1
            (1, 4, true),  // DeviceDual2
            (1, 0, false), // FlasherSingle
            (2, 4, false), // FlasherDual1
            (2, 0, true),  // FlasherDual2
        ];
        for (scheme, (byte, shift, binpatch)) in OtaScheme::ALL.into_iter().zip(expected) {
            assert_eq!(scheme.byte(), byte, "{scheme:?}");
            assert_eq!(scheme.shift(), shift, "{scheme:?}");
            assert_eq!(scheme.requires_binpatch(), binpatch, "{scheme:?}");
        }
    }

    #[test]
    fn set_nibble_round_trips() {
        for scheme in OtaScheme::ALL {
            let mut payload = [0u8; 3];
            scheme.set_nibble(&mut payload, 5);
            assert_eq!(scheme.nibble(&payload), 5);
            let others = OtaScheme::ALL
                .into_iter()
                .filter(|s| *s != scheme)
                .map(|s| s.nibble(&payload))
                .sum::<u8>();
            assert_eq!(others, 0);
        }
    }

    #[test]
    fn part_list_requires_data_for_the_scheme() {
        let payload = [0x11, 0x00, 0x00];
        assert!(check_part_list(OtaScheme::DeviceSingle, &payload).is_ok());
        assert!(check_part_list(OtaScheme::DeviceDual1, &payload).is_ok());
        assert_eq!(
            check_part_list(OtaScheme::DeviceDual2, &payload),
            Err(Uf2OtaError::OtaWrong)
        );
        assert_eq!(
            check_part_list(OtaScheme::DeviceSingle, &[0x11]),
            Err(Uf2OtaError::OtaWrong)
        );
    }

    fn info(indexes: [u8; 6], names: &[&str]) -> Vec<u8> {
        let mut payload = vec![0u8; 3];
        for (scheme, index) in OtaScheme::ALL.into_iter().zip(indexes) {
            scheme.set_nibble(&mut payload[..3], index);
        }
        for name in names {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
        payload
    }

    #[test]
    fn selects_the_indexed_name() {
        let payload = info([1, 0, 2, 0, 0, 0], &["app", "download"]);
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Ok(Some("app"))
        );
        assert_eq!(select_partition(OtaScheme::DeviceDual1, &payload), Ok(None));
        assert_eq!(
            select_partition(OtaScheme::DeviceDual2, &payload),
            Ok(Some("download"))
        );
    }

    #[test]
    fn index_six_resolves_sixth_name() {
        let names = ["p1", "p2", "p3", "p4", "p5", "p6"];
        let payload = info([6, 0, 0, 0, 0, 0], &names);
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Ok(Some("p6"))
        );
    }

    #[test]
    fn index_six_with_five_names_is_invalid() {
        let payload = info([6, 0, 0, 0, 0, 0], &["p1", "p2", "p3", "p4", "p5"]);
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Err(Uf2OtaError::PartitionInvalid)
        );
    }

    #[test]
    fn index_over_six_is_invalid() {
        let payload = info([7, 0, 0, 0, 0, 0], &["p1"]);
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Err(Uf2OtaError::PartitionInvalid)
        );
    }

    #[test]
    fn empty_names_and_missing_terminators_are_invalid() {
        // empty name
        let mut payload = vec![0u8; 3];
        OtaScheme::DeviceSingle.set_nibble(&mut payload, 2);
        payload.extend_from_slice(b"\0app\0");
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Err(Uf2OtaError::PartitionInvalid)
        );

        // name runs off the end of the tag
        let mut payload = vec![0u8; 3];
        OtaScheme::DeviceSingle.set_nibble(&mut payload, 1);
        payload.extend_from_slice(b"app");
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &payload),
            Err(Uf2OtaError::PartitionInvalid)
        );
    }

    #[test]
    fn too_short_payload_is_invalid() {
        assert_eq!(
            select_partition(OtaScheme::DeviceSingle, &[0x10]),
            Err(Uf2OtaError::PartitionInvalid)
        );
    }
}
