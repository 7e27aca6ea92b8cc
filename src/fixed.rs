// src/fixed.rs
//
// 16:16 fixed-point values used as command arguments.

use crate::error::{Error, Result};

/// Maximum number of arguments to a program or message.
pub const MAX_ARGS: usize = 8;

/// A 32-bit signed 16:16 fixed-point value.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(pub i32);

impl Fixed {
    pub const ONE: Fixed = Fixed(1 << 16);
    pub const ZERO: Fixed = Fixed(0);

    #[inline]
    pub fn from_f32(value: f32) -> Self {
        Fixed((value * 65536.0) as i32)
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 65536.0
    }

    #[inline]
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl From<f32> for Fixed {
    fn from(value: f32) -> Self {
        Fixed::from_f32(value)
    }
}

/// Fixed-capacity argument list carried by commands.
///
/// Never allocates, so it can travel through the command queue and be
/// consumed by the audio context as-is.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Args {
    values: [Fixed; MAX_ARGS],
    len: usize,
}

impl Args {
    pub const EMPTY: Args = Args {
        values: [Fixed::ZERO; MAX_ARGS],
        len: 0,
    };

    /// Build from pre-converted fixed-point values.
    pub fn from_fixed(values: &[Fixed]) -> Result<Self> {
        if values.len() > MAX_ARGS {
            return Err(Error::ArgCount {
                expected: MAX_ARGS,
                got: values.len(),
            });
        }
        let mut args = Args::EMPTY;
        args.values[..values.len()].copy_from_slice(values);
        args.len = values.len();
        Ok(args)
    }

    /// Build from raw 16:16 integers, as passed through the C ABI.
    pub fn from_raw(values: &[i32]) -> Result<Self> {
        if values.len() > MAX_ARGS {
            return Err(Error::ArgCount {
                expected: MAX_ARGS,
                got: values.len(),
            });
        }
        let mut args = Args::EMPTY;
        for (slot, v) in args.values.iter_mut().zip(values) {
            *slot = Fixed(*v);
        }
        args.len = values.len();
        Ok(args)
    }

    #[inline]
    pub fn as_slice(&self) -> &[Fixed] {
        &self.values[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Argument `i` as a float, or `default` if it was not supplied.
    #[inline]
    pub fn get_f32(&self, i: usize, default: f32) -> f32 {
        self.as_slice().get(i).map_or(default, |v| v.to_f32())
    }
}

/// Convert floating-point arguments into a fixed-point argument list.
pub fn args(values: &[f32]) -> Result<Args> {
    if values.len() > MAX_ARGS {
        return Err(Error::ArgCount {
            expected: MAX_ARGS,
            got: values.len(),
        });
    }
    let mut out = Args::EMPTY;
    for (slot, v) in out.values.iter_mut().zip(values) {
        *slot = Fixed::from_f32(*v);
    }
    out.len = values.len();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_conversion() {
        assert_eq!(Fixed::from_f32(1.0), Fixed::ONE);
        assert_eq!(Fixed::from_f32(-0.5).raw(), -32768);
        assert_eq!(Fixed(98304).to_f32(), 1.5);
    }

    #[test]
    fn test_args_builder() {
        let a = args(&[1.0, 0.25]).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.as_slice()[1], Fixed(16384));
        assert_eq!(a.get_f32(0, 0.0), 1.0);
        assert_eq!(a.get_f32(5, 3.0), 3.0);
    }

    #[test]
    fn test_too_many_args() {
        let values = [0.0f32; MAX_ARGS + 1];
        assert!(matches!(args(&values), Err(Error::ArgCount { .. })));
        assert!(Args::from_raw(&[0; MAX_ARGS + 1]).is_err());
    }
}
