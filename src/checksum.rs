// Internet checksum (RFC 1071).

/// Computes a one's-complement running sum over a slice; the result is not folded.
pub type SumFn = fn(&[u8]) -> u32;

#[derive(Clone, Copy)]
pub struct Checksummer {
    sum: SumFn,
}

impl Checksummer {
    pub const fn new(sum: SumFn) -> Checksummer {
        Checksummer { sum }
    }

    pub fn sum(&self, data: &[u8]) -> u32 {
        (self.sum)(data)
    }

    pub fn checksum(&self, partial_sum: u32, data: &[u8]) -> [u8; 2] {
        let mut sum = partial_sum as u64 + self.sum(data) as u64;
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        (!(sum as u16)).to_be_bytes()
    }
}

impl Default for Checksummer {
    fn default() -> Checksummer {
        Checksummer::new(sum_compat)
    }
}

pub fn sum_compat(data: &[u8]) -> u32 {
    // LLVM auto-vectorizes this loop (see https://www.nickwilcox.com/blog/autovec/).
    // A 65535 byte buffer sums to at most 0x7ffe8001, so u32 never overflows here.
    let mut iter = data.chunks_exact(2);
    let full_sum = iter
        .by_ref()
        .map(|bytes| ((bytes[0] as u32) << 8) | (bytes[1] as u32))
        .sum::<u32>();
    let remain_sum = match *iter.remainder() {
        [high] => (high as u32) << 8,
        _ => 0u32,
    };
    full_sum + remain_sum
}

pub fn sum_wide(data: &[u8]) -> u32 {
    // 2^16 is congruent to 1 modulo 0xffff, so adding 32-bit words gives the same folded result.
    let mut iter = data.chunks_exact(4);
    let mut sum = iter
        .by_ref()
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
        .sum::<u64>();
    sum += sum_compat(iter.remainder()) as u64;
    while sum >> 32 != 0 {
        sum = (sum >> 32) + (sum & 0xffff_ffff);
    }
    let sum = sum as u32;
    (sum >> 16) + (sum & 0xffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn rfc1071_example() {
        // Sample data from RFC 1071, Section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(sum_compat(&data), 0x2ddf0);
        let checksummer = Checksummer::default();
        assert_eq!(checksummer.checksum(0, &data), (!0xddf2u16).to_be_bytes());
    }

    #[test]
    fn odd_length_is_zero_padded() {
        assert_eq!(sum_compat(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
        assert_eq!(sum_wide(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn checksum_validates_to_zero() {
        let checksummer = Checksummer::default();
        let mut header = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        let checksum = checksummer.checksum(0, &header);
        assert_eq!(checksum, [0xb1, 0xe6]);
        header[10..12].copy_from_slice(&checksum);
        assert_eq!(checksummer.checksum(0, &header), [0, 0]);
    }

    #[test]
    fn partial_sum_is_included() {
        let checksummer = Checksummer::default();
        let data = [0xab, 0xcd, 0x12, 0x34];
        let pseudo = [0x0a, 0x00, 0x00, 0x01, 0x00, 0x11];
        let mut joined = pseudo.to_vec();
        joined.extend_from_slice(&data);
        assert_eq!(
            checksummer.checksum(sum_compat(&pseudo), &data),
            checksummer.checksum(0, &joined)
        );
    }

    #[test]
    fn strategies_agree() {
        let compat = Checksummer::new(sum_compat);
        let wide = Checksummer::new(sum_wide);
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 2, 3, 5, 20, 41, 1500, 65535] {
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            let partial = rng.gen_range(0..0x0010_0000u32);
            assert_eq!(
                compat.checksum(partial, &data),
                wide.checksum(partial, &data),
                "length {}",
                len
            );
        }
        let ones = vec![0xffu8; 65535];
        assert_eq!(compat.checksum(0, &ones), wide.checksum(0, &ones));
    }
}
