//! Marshal traits for composite types

use uuid::Uuid;

use crate::error::Result;
use crate::reader::NdrReader;
use crate::writer::NdrWriter;

/// A type that can encode itself into an NDR stream
pub trait NdrMarshal {
    fn marshal(&self, w: &mut NdrWriter) -> Result<()>;
}

/// A type that can decode itself from an NDR stream
pub trait NdrUnmarshal: Sized {
    fn unmarshal(r: &mut NdrReader<'_>) -> Result<Self>;
}

macro_rules! scalar_impl {
    ($ty:ty, $write:ident, $read:ident) => {
        impl NdrMarshal for $ty {
            fn marshal(&self, w: &mut NdrWriter) -> Result<()> {
                w.$write(*self);
                Ok(())
            }
        }
        impl NdrUnmarshal for $ty {
            fn unmarshal(r: &mut NdrReader<'_>) -> Result<Self> {
                r.$read()
            }
        }
    };
}

scalar_impl!(u8, write_u8, read_u8);
scalar_impl!(i8, write_i8, read_i8);
scalar_impl!(u16, write_u16, read_u16);
scalar_impl!(i16, write_i16, read_i16);
scalar_impl!(u32, write_u32, read_u32);
scalar_impl!(i32, write_i32, read_i32);
scalar_impl!(u64, write_u64, read_u64);
scalar_impl!(i64, write_i64, read_i64);
scalar_impl!(f32, write_f32, read_f32);
scalar_impl!(f64, write_f64, read_f64);

impl NdrMarshal for Uuid {
    fn marshal(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_uuid(self);
        Ok(())
    }
}

impl NdrUnmarshal for Uuid {
    fn unmarshal(r: &mut NdrReader<'_>) -> Result<Self> {
        r.read_uuid()
    }
}

impl NdrMarshal for String {
    fn marshal(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_string(self)
    }
}

impl NdrUnmarshal for String {
    fn unmarshal(r: &mut NdrReader<'_>) -> Result<Self> {
        r.read_string()
    }
}

impl NdrMarshal for () {
    fn marshal(&self, _w: &mut NdrWriter) -> Result<()> {
        Ok(())
    }
}

impl NdrUnmarshal for () {
    fn unmarshal(_r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(())
    }
}
