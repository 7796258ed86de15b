//! Opcode table.

use std::fmt;

/// Number of operands an instruction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// No operands.
    TypeN,
    /// One operand.
    TypeA,
    /// Two operands.
    TypeAB,
}

impl NodeKind {
    /// Operand count.
    #[must_use]
    pub const fn operands(self) -> usize {
        match self {
            Self::TypeN => 0,
            Self::TypeA => 1,
            Self::TypeAB => 2,
        }
    }
}

macro_rules! define_opcodes {
    ($($name:ident = $id:literal, $kind:ident, $mnemonic:literal;)*) => {
        /// Instruction identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $name = $id,
            )*
        }

        impl Opcode {
            /// Every opcode, in id order.
            pub const ALL: &'static [Self] = &[$(Self::$name),*];

            /// Opcode with the given id.
            #[must_use]
            pub const fn from_id(id: u8) -> Option<Self> {
                match id {
                    $($id => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Operand layout.
            #[must_use]
            pub const fn kind(self) -> NodeKind {
                match self {
                    $(Self::$name => NodeKind::$kind,)*
                }
            }

            /// Assembler name.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic,)*
                }
            }
        }
    };
}

define_opcodes! {
    Nop = 0x00, TypeN, "nop";
    Halt = 0x01, TypeN, "halt";
    Ret = 0x02, TypeA, "ret";
    Move = 0x03, TypeAB, "move";
    LoadNil = 0x04, TypeA, "load_nil";
    LoadImm = 0x05, TypeAB, "load_imm";
    LoadConst = 0x06, TypeAB, "load_const";
    LoadGlobal = 0x07, TypeAB, "load_global";
    StoreGlobal = 0x08, TypeAB, "store_global";
    Add = 0x09, TypeAB, "add";
    Sub = 0x0a, TypeAB, "sub";
    Mul = 0x0b, TypeAB, "mul";
    Div = 0x0c, TypeAB, "div";
    Mod = 0x0d, TypeAB, "mod";
    Neg = 0x0e, TypeA, "neg";
    Not = 0x0f, TypeA, "not";
    Eq = 0x10, TypeAB, "eq";
    Lt = 0x11, TypeAB, "lt";
    Le = 0x12, TypeAB, "le";
    Concat = 0x13, TypeAB, "concat";
    Jump = 0x14, TypeA, "jump";
    JumpIfTrue = 0x15, TypeAB, "jump_if_true";
    JumpIfFalse = 0x16, TypeAB, "jump_if_false";
    Call = 0x17, TypeAB, "call";
    NewArray = 0x18, TypeAB, "new_array";
    NewTable = 0x19, TypeA, "new_table";
    GetIndex = 0x1a, TypeAB, "get_index";
    SetIndex = 0x1b, TypeAB, "set_index";
    Push = 0x1c, TypeA, "push";
    Pop = 0x1d, TypeN, "pop";
    Yield = 0x1e, TypeN, "yield";
}

impl Opcode {
    /// Numeric id.
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
