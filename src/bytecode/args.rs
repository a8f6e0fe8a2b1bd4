// Strand Call Arguments Info

/// Packed call arguments description.
///
/// Low 6 bits hold the passed arguments count, the remaining 26 bits flag
/// which default arguments were used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FuncArgsInfo(u32);

impl FuncArgsInfo {
    pub const ARGS_NUM_BITS: u32 = 6;
    pub const ARGS_NUM_MASK: u32 = (1 << Self::ARGS_NUM_BITS) - 1;
    pub const MAX_ARGS: usize = Self::ARGS_NUM_MASK as usize;
    pub const MAX_DEFAULT_ARGS: usize = (32 - Self::ARGS_NUM_BITS) as usize;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Plain call passing `n` arguments, panics past `MAX_ARGS`
    pub fn with_args(n: usize) -> Self {
        let mut info = Self(0);
        if !info.set_args_num(n) {
            panic!("Too many arguments: {}", n);
        }
        info
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn count_args(&self) -> usize {
        (self.0 & Self::ARGS_NUM_MASK) as usize
    }

    pub fn set_args_num(&mut self, n: usize) -> bool {
        if n > Self::MAX_ARGS {
            return false;
        }
        self.0 = (self.0 & !Self::ARGS_NUM_MASK) | n as u32;
        true
    }

    pub fn use_default_arg(&mut self, idx: usize) -> bool {
        if idx >= Self::MAX_DEFAULT_ARGS {
            return false;
        }
        self.0 |= 1 << (Self::ARGS_NUM_BITS as usize + idx);
        true
    }

    pub fn is_default_arg_used(&self, idx: usize) -> bool {
        idx < Self::MAX_DEFAULT_ARGS && self.0 & (1 << (Self::ARGS_NUM_BITS as usize + idx)) != 0
    }

    pub fn count_used_default_args(&self) -> usize {
        (self.0 >> Self::ARGS_NUM_BITS).count_ones() as usize
    }
}
