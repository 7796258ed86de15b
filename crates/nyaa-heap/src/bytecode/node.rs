//! Single instruction nodes and their word encoding.

use std::fmt;

use bumpalo::Bump;

use super::opcode::{NodeKind, Opcode};
use crate::error::BytecodeError;

const OPCODE_MASK: u64 = 0xff;
const SCALE_SHIFT: u32 = 8;
const SCALE_MASK: u64 = 0b11;
const OPERAND_SHIFT: u32 = 10;

/// Operand width in bits for each scale.
const WIDTHS: [u32; 3] = [8, 16, 24];

/// Smallest operand value.
pub const OPERAND_MIN: i32 = -(1 << 23);
/// Largest operand value.
pub const OPERAND_MAX: i32 = (1 << 23) - 1;

const fn fits(value: i32, width: u32) -> bool {
    let half = 1_i64 << (width - 1);
    -half <= value as i64 && (value as i64) < half
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BytecodeNode {
    opcode: Opcode,
    params: [i32; 2],
}

impl BytecodeNode {
    /// Instruction `opcode` with `params`.
    ///
    /// # Errors
    ///
    /// [`BytecodeError::KindMismatch`] when the operand count is wrong for
    /// the opcode, and [`BytecodeError::OperandOutOfRange`] when an operand
    /// does not fit 24 bits.
    pub fn new(opcode: Opcode, params: &[i32]) -> Result<Self, BytecodeError> {
        let expected = opcode.kind().operands();
        if params.len() != expected {
            return Err(BytecodeError::KindMismatch {
                opcode: opcode.mnemonic(),
                expected,
                found: params.len(),
            });
        }
        let mut node = Self {
            opcode,
            params: [0; 2],
        };
        for (slot, &value) in node.params.iter_mut().zip(params) {
            if !(OPERAND_MIN..=OPERAND_MAX).contains(&value) {
                return Err(BytecodeError::OperandOutOfRange(i64::from(value)));
            }
            *slot = value;
        }
        Ok(node)
    }

    /// Instruction without operands.
    ///
    /// # Errors
    ///
    /// See [`BytecodeNode::new`].
    pub fn n(opcode: Opcode) -> Result<Self, BytecodeError> {
        Self::new(opcode, &[])
    }

    /// Instruction with one operand.
    ///
    /// # Errors
    ///
    /// See [`BytecodeNode::new`].
    pub fn a(opcode: Opcode, a: i32) -> Result<Self, BytecodeError> {
        Self::new(opcode, &[a])
    }

    /// Instruction with two operands.
    ///
    /// # Errors
    ///
    /// See [`BytecodeNode::new`].
    pub fn ab(opcode: Opcode, a: i32, b: i32) -> Result<Self, BytecodeError> {
        Self::new(opcode, &[a, b])
    }

    /// The instruction.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Operand layout of the instruction.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.opcode.kind()
    }

    /// The operands, as many as the kind carries.
    #[must_use]
    pub fn params(&self) -> &[i32] {
        &self.params[..self.kind().operands()]
    }

    /// Operand `index`, if the kind carries it.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<i32> {
        self.params().get(index).copied()
    }

    /// Smallest scale whose width fits every operand.
    #[must_use]
    pub fn scale(&self) -> u8 {
        let params = self.params();
        let mut scale = 0;
        while !params.iter().all(|&p| fits(p, WIDTHS[scale])) {
            scale += 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        let scale = scale as u8;
        scale
    }

    /// Pack into one word.
    #[must_use]
    pub fn encode(&self) -> u64 {
        let scale = self.scale();
        let width = WIDTHS[usize::from(scale)];
        let mask = (1_u64 << width) - 1;
        let mut word = u64::from(self.opcode.id()) | (u64::from(scale) << SCALE_SHIFT);
        for (i, &param) in self.params().iter().enumerate() {
            #[allow(clippy::cast_sign_loss)]
            let bits = (i64::from(param) as u64) & mask;
            #[allow(clippy::cast_possible_truncation)]
            let shift = OPERAND_SHIFT + i as u32 * width;
            word |= bits << shift;
        }
        word
    }

    /// Unpack `word` into a node allocated in `arena`.
    ///
    /// # Errors
    ///
    /// [`BytecodeError::UnknownOpcode`], [`BytecodeError::InvalidScale`], or
    /// [`BytecodeError::TrailingBits`] when bits above the last operand are
    /// set.
    pub fn decode(arena: &Bump, word: u64) -> Result<&Self, BytecodeError> {
        Ok(arena.alloc(Self::unpack(word)?))
    }

    pub(super) fn unpack(word: u64) -> Result<Self, BytecodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let id = (word & OPCODE_MASK) as u8;
        let opcode = Opcode::from_id(id).ok_or(BytecodeError::UnknownOpcode(id))?;
        #[allow(clippy::cast_possible_truncation)]
        let scale = ((word >> SCALE_SHIFT) & SCALE_MASK) as u8;
        let width = *WIDTHS
            .get(usize::from(scale))
            .ok_or(BytecodeError::InvalidScale(scale))?;
        let count = opcode.kind().operands();

        #[allow(clippy::cast_possible_truncation)]
        let used = OPERAND_SHIFT + count as u32 * width;
        if word >> used != 0 {
            return Err(BytecodeError::TrailingBits(word));
        }

        let mask = (1_u64 << width) - 1;
        let mut params = [0; 2];
        for (i, param) in params.iter_mut().take(count).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let bits = (word >> (OPERAND_SHIFT + i as u32 * width)) & mask;
            // Sign extend from `width` bits.
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let value = ((bits << (64 - width)) as i64 >> (64 - width)) as i32;
            *param = value;
        }
        Ok(Self { opcode, params })
    }
}

impl fmt::Display for BytecodeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        for (i, param) in self.params().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{param}")?;
        }
        Ok(())
    }
}
