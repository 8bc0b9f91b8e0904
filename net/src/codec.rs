//! Codec trait used to serialize typed cells of a [`crate::replicated::ReplicatedContainer`]
//! onto a [`Buffer`], plus builtin implementations for the primitive types the buffer
//! codec already knows how to read and write.

use crate::buffer::Buffer;
use crate::error::PacketError;

/// A codec for a replicated-cell value, read and written without any external
/// configuration.
pub trait SimpleCodec: Sized {
    fn write(&self, buf: &mut Buffer) -> Result<(), PacketError>;
    fn read(buf: &mut Buffer) -> Result<Self, PacketError>;
}

impl SimpleCodec for String {

    #[inline(always)]
    fn write(&self, buf: &mut Buffer) -> Result<(), PacketError> {
        buf.write_string(self)
    }

    #[inline(always)]
    fn read(buf: &mut Buffer) -> Result<Self, PacketError> {
        buf.read_string()
    }

}

macro_rules! impl_builtin_copy {
    ($ty:ty, $write_method:ident, $read_method:ident) => {
        impl SimpleCodec for $ty {

            #[inline(always)]
            fn write(&self, buf: &mut Buffer) -> Result<(), PacketError> {
                buf.$write_method(*self)
            }

            #[inline(always)]
            fn read(buf: &mut Buffer) -> Result<Self, PacketError> {
                buf.$read_method()
            }

        }
    };
}

impl_builtin_copy!(bool, write_bool, read_bool);
impl_builtin_copy!(u8, write_u8, read_u8);
impl_builtin_copy!(i8, write_i8, read_i8);
impl_builtin_copy!(u16, write_u16, read_u16);
impl_builtin_copy!(i16, write_i16, read_i16);
impl_builtin_copy!(u32, write_u32, read_u32);
impl_builtin_copy!(i32, write_i32, read_i32);
impl_builtin_copy!(f32, write_f32, read_f32);
