/// Adler-32 checksum over a fixed-length window that can slide one byte at a
/// time in O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone)]
pub struct Adler32Window {
    a: u32,
    b: u32,
    len: u32,
}

impl Adler32Window {
    /// Checksum of `window`; its length becomes the window length.
    pub fn over(window: &[u8]) -> Self {
        // Sum in u64 and reduce once at the end.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in window {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            len: window.len() as u32 % MOD_ADLER,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;
        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        let dropped = (out * self.len + 1) % MOD_ADLER;
        self.b = (self.b + self.a + MOD_ADLER - dropped) % MOD_ADLER;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_adler32() {
        // Adler-32("Wikipedia") = 0x11E60398
        assert_eq!(Adler32Window::over(b"Wikipedia").value(), 0x11E6_0398);
    }

    #[test]
    fn rolling_equals_fresh_checksum() {
        let data: Vec<u8> = (0..600u32).map(|i| (i * 7 % 256) as u8).collect();
        let width = 64;
        let mut window = Adler32Window::over(&data[..width]);
        for start in 1..=data.len() - width {
            window.roll(data[start - 1], data[start + width - 1]);
            assert_eq!(
                window.value(),
                Adler32Window::over(&data[start..start + width]).value(),
                "mismatch at offset {start}"
            );
        }
    }
}
