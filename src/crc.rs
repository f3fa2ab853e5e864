//! CRC-16/CCITT (polynomial 0x1021, zero init), computed a nibble at a time.

const TABLE: [u16; 16] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
];

/// Fold one byte into the accumulator, high nibble first.
pub const fn update(acc: u16, byte: u8) -> u16 {
    let i = (acc >> 12) ^ (byte >> 4) as u16;
    let acc = TABLE[(i & 0x0f) as usize] ^ (acc << 4);
    let i = (acc >> 12) ^ (byte & 0x0f) as u16;
    TABLE[(i & 0x0f) as usize] ^ (acc << 4)
}

/// CRC of a whole buffer.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0, |acc, &b| update(acc, b))
}

/// Running accumulator.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Crc16(u16);

impl Crc16 {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn update(&mut self, byte: u8) {
        self.0 = update(self.0, byte);
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const XMODEM: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

    #[test]
    fn check_value() {
        assert_eq!(checksum(b"123456789"), 0x31c3);
    }

    #[test]
    fn matches_reference_implementation() {
        let inputs: [&[u8]; 5] = [
            b"",
            &[0x00],
            &[0x01, 0x04, 0x10],
            b":04000000DEADBEEFC4",
            &[0xff; 37],
        ];
        for input in inputs.iter() {
            assert_eq!(checksum(input), XMODEM.checksum(input), "input {:02x?}", input);
        }

        let every_byte: Vec<u8> = (0..=255).collect();
        assert_eq!(checksum(&every_byte), XMODEM.checksum(&every_byte));
    }

    #[test]
    fn split_accumulation_is_consistent() {
        let data = b"hexboot split accumulation";
        let whole = checksum(data);

        for split in 0..=data.len() {
            let (head, tail) = data.split_at(split);
            let mut crc = Crc16::new();
            head.iter().for_each(|&b| crc.update(b));
            let acc = tail.iter().fold(crc.value(), |acc, &b| update(acc, b));
            assert_eq!(acc, whole, "split at {}", split);
        }
    }

    #[test]
    fn trailing_crc_folds_to_zero() {
        let payload = [0x01, 0x42];
        let crc = checksum(&payload);
        let mut acc = Crc16::new();
        payload.iter().chain(crc.to_be_bytes().iter()).for_each(|&b| acc.update(b));
        assert_eq!(acc.value(), 0);

        acc.reset();
        assert_eq!(acc, Crc16::default());
    }

    proptest! {
        #[test]
        fn any_split_accumulates_to_whole(
            data in prop::collection::vec(any::<u8>(), 0..512),
            split in any::<prop::sample::Index>(),
        ) {
            let whole = checksum(&data);
            prop_assert_eq!(whole, XMODEM.checksum(&data));

            let (head, tail) = data.split_at(split.index(data.len() + 1));
            let mut crc = Crc16::new();
            head.iter().chain(tail.iter()).for_each(|&b| crc.update(b));
            prop_assert_eq!(crc.value(), whole);

            prop_assert_eq!(update_all(checksum(head), tail), whole);
        }
    }

    fn update_all(acc: u16, bytes: &[u8]) -> u16 {
        bytes.iter().fold(acc, |acc, &b| update(acc, b))
    }
}
