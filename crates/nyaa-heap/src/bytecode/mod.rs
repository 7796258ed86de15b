//! Bytecode instruction encoding.
//!
//! Each instruction packs into one `u64`:
//!
//! ```text
//! [ 0 .. | operand B (w) | operand A (w) | scale (2) | opcode (8) ]
//! ```
//!
//! The scale picks the operand width `w` (0: 8 bits, 1: 16 bits, 2: 24 bits)
//! and is the smallest that fits every operand of the node. Operands are two's
//! complement. Decoded nodes live in a [`bumpalo::Bump`] arena and are never
//! freed individually.
//!
//! ```
//! use bumpalo::Bump;
//! use nyaa_heap::bytecode::{decode_stream, encode_stream, BytecodeNode, Opcode};
//!
//! let program = [
//!     BytecodeNode::ab(Opcode::LoadImm, 0, 1000).unwrap(),
//!     BytecodeNode::a(Opcode::Ret, 0).unwrap(),
//! ];
//! let words = encode_stream(&program);
//! let arena = Bump::new();
//! let decoded = decode_stream(&arena, &words).unwrap();
//! assert_eq!(decoded[0].param(1), Some(1000));
//! ```

mod node;
mod opcode;

pub use node::{BytecodeNode, OPERAND_MAX, OPERAND_MIN};
pub use opcode::{NodeKind, Opcode};

use bumpalo::Bump;

use crate::error::StreamError;

/// Encode every node in order.
pub fn encode_stream<'a>(nodes: impl IntoIterator<Item = &'a BytecodeNode>) -> Vec<u64> {
    nodes.into_iter().map(BytecodeNode::encode).collect()
}

/// Decode every word in order into nodes allocated in `arena`.
///
/// # Errors
///
/// The first invalid word, with its index.
pub fn decode_stream<'a>(arena: &'a Bump, words: &[u64]) -> Result<Vec<&'a BytecodeNode>, StreamError> {
    words
        .iter()
        .enumerate()
        .map(|(index, &word)| {
            BytecodeNode::unpack(word)
                .map(|node| &*arena.alloc(node))
                .map_err(|error| StreamError { index, error })
        })
        .collect()
}

/// One line per node, prefixed with its index.
pub fn disassemble<'a>(nodes: impl IntoIterator<Item = &'a BytecodeNode>) -> String {
    nodes
        .into_iter()
        .enumerate()
        .map(|(index, node)| format!("{index:>4}  {node}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BytecodeError;

    fn program() -> Vec<BytecodeNode> {
        vec![
            BytecodeNode::ab(Opcode::LoadImm, 0, 42).expect("node"),
            BytecodeNode::ab(Opcode::LoadConst, 1, 70_000).expect("node"),
            BytecodeNode::ab(Opcode::Add, 0, 1).expect("node"),
            BytecodeNode::a(Opcode::Jump, -3).expect("node"),
            BytecodeNode::n(Opcode::Halt).expect("node"),
        ]
    }

    #[test]
    fn test_stream_round_trip() {
        let program = program();
        let words = encode_stream(&program);
        assert_eq!(words.len(), program.len());
        let arena = Bump::new();
        let decoded = decode_stream(&arena, &words).expect("decode");
        let decoded: Vec<BytecodeNode> = decoded.into_iter().copied().collect();
        assert_eq!(decoded, program);
    }

    #[test]
    fn test_stream_error_index() {
        let mut words = encode_stream(&program());
        words[2] = 0xfe;
        let arena = Bump::new();
        let err = decode_stream(&arena, &words).expect_err("bad word");
        assert_eq!(err.index, 2);
        assert_eq!(err.error, BytecodeError::UnknownOpcode(0xfe));
    }

    #[test]
    fn test_disassemble() {
        let text = disassemble(&program());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "   0  load_imm 0, 42");
        assert_eq!(lines[3], "   3  jump -3");
        assert_eq!(lines[4], "   4  halt");
        assert_eq!(lines.len(), 5);
        assert!(text.ends_with('\n'));
    }
}
