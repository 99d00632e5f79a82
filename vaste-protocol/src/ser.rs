//! Little-endian primitive reads and writes for the binary chunk frames.

use std::io::{self, Read};

/// A value that can be appended to a frame buffer.
pub trait WriteTo {
    /// Appends the little-endian encoding of `self` to `out`.
    fn write(&self, out: &mut Vec<u8>);
}

/// A value that can be read from a frame buffer.
pub trait ReadFrom: Sized {
    /// Reads a little-endian value.
    fn read(data: &mut impl Read) -> io::Result<Self>;
}

macro_rules! impl_le {
    ($($ty:ty),*) => {
        $(
            impl WriteTo for $ty {
                fn write(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl ReadFrom for $ty {
                fn read(data: &mut impl Read) -> io::Result<Self> {
                    let mut buf = [0; size_of::<Self>()];
                    data.read_exact(&mut buf)?;
                    Ok(Self::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_le!(u8, u16, u32, i32);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn little_endian_roundtrip() {
        let mut out = Vec::new();
        0x0102_0304_u32.write(&mut out);
        (-5_i32).write(&mut out);
        0xBEEF_u16.write(&mut out);
        assert_eq!(&out[..4], &[0x04, 0x03, 0x02, 0x01]);

        let mut cur = Cursor::new(out.as_slice());
        assert_eq!(u32::read(&mut cur).unwrap(), 0x0102_0304);
        assert_eq!(i32::read(&mut cur).unwrap(), -5);
        assert_eq!(u16::read(&mut cur).unwrap(), 0xBEEF);
    }
}
