//! Bytecode instruction stream.
//!
//! A compiled program is a flat sequence of fixed-width [`Slot`]s: a
//! two-slot header (`input register count`, `entry instruction index`)
//! followed by instructions. Every opcode is immediately followed by
//! exactly the operand slots it requires, so the instruction pointer
//! advances at a fixed stride per operand.
//!
//! Operand addresses are offsets *back from the current stack pointer*,
//! which makes the same instruction reusable at any call-frame depth.

use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Halt successfully; fragment registers are written back.
    End,
    /// Grow the stack by a literal slot count (new slots are zeroed).
    Push,
    /// Shrink the stack by a literal slot count.
    Pop,
    /// Absolute jump.
    Jmp,
    /// Jump when no lane of the current mask is set.
    TestJz,
    /// Pop a saved return address off the stack and jump to it.
    Return,
    /// Save the current mask on the mask stack.
    TestPush,
    /// Restore the mask from the mask stack.
    TestPop,
    /// Fold the staged test register into the mask: `mask &= test`.
    TestAnd,
    /// `mask |= test`.
    TestOr,
    /// Flip to the else-lanes relative to the saved enclosing mask.
    TestInv,
    SetRr,
    SetRi,
    /// Masked store: only lanes permitted by the current mask change.
    MsetRr,
    MsetRi,
    AddRr,
    AddRi,
    SubRr,
    SubRi,
    MulRr,
    MulRi,
    DivRr,
    DivRi,
    EqRr,
    EqRi,
    NeRr,
    NeRi,
    LtRr,
    LtRi,
    LeRr,
    LeRi,
    GtRr,
    GtRi,
    GeRr,
    GeRi,
}

impl OpCode {
    /// Operand layout: number of address slots, then whether an
    /// immediate slot follows.
    pub fn operands(self) -> (usize, bool) {
        use OpCode::*;
        match self {
            End | Return | TestPush | TestPop | TestAnd | TestOr | TestInv => (0, false),
            Push | Pop | Jmp | TestJz => (1, false),
            SetRr | MsetRr | AddRr | SubRr | MulRr | DivRr | EqRr | NeRr | LtRr | LeRr | GtRr
            | GeRr => (2, false),
            SetRi | MsetRi | AddRi | SubRi | MulRi | DivRi | EqRi | NeRi | LtRi | LeRi | GtRi
            | GeRi => (1, true),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            End => "end",
            Push => "push",
            Pop => "pop",
            Jmp => "jmp",
            TestJz => "test.jz",
            Return => "return",
            TestPush => "test.push",
            TestPop => "test.pop",
            TestAnd => "test.and",
            TestOr => "test.or",
            TestInv => "test.inv",
            SetRr => "set.rr",
            SetRi => "set.ri",
            MsetRr => "mset.rr",
            MsetRi => "mset.ri",
            AddRr => "add.rr",
            AddRi => "add.ri",
            SubRr => "sub.rr",
            SubRi => "sub.ri",
            MulRr => "mul.rr",
            MulRi => "mul.ri",
            DivRr => "div.rr",
            DivRi => "div.ri",
            EqRr => "eq.rr",
            EqRi => "eq.ri",
            NeRr => "ne.rr",
            NeRi => "ne.ri",
            LtRr => "lt.rr",
            LtRi => "lt.ri",
            LeRr => "le.rr",
            LeRi => "le.ri",
            GtRr => "gt.rr",
            GtRi => "gt.ri",
            GeRr => "ge.rr",
            GeRi => "ge.ri",
        }
    }

    fn from_u8(v: u8) -> Option<OpCode> {
        use OpCode::*;
        const TABLE: [OpCode; 35] = [
            End, Push, Pop, Jmp, TestJz, Return, TestPush, TestPop, TestAnd, TestOr, TestInv,
            SetRr, SetRi, MsetRr, MsetRi, AddRr, AddRi, SubRr, SubRi, MulRr, MulRi, DivRr, DivRi,
            EqRr, EqRi, NeRr, NeRi, LtRr, LtRi, LeRr, LeRi, GtRr, GtRi, GeRr, GeRi,
        ];
        TABLE.get(v as usize).copied()
    }
}

/// One fixed-width element of the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Op(OpCode),
    Addr(u32),
    Imm(f32),
}

/// Describes one slot-block of a program's external input contract, in
/// `main`-parameter order. Kept alongside the bytecode for drivers; not
/// part of the serialized stream.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub name: String,
    pub ty: crate::ast::ScalarType,
    pub writable: bool,
}

/// A compiled shader program: the slot stream plus input metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderProgram {
    pub(crate) code: Vec<Slot>,
    pub(crate) inputs: Vec<InputBinding>,
}

impl ShaderProgram {
    pub const HEADER_SLOTS: usize = 2;

    pub(crate) fn new() -> Self {
        ShaderProgram {
            code: vec![Slot::Addr(0), Slot::Addr(0)],
            inputs: Vec::new(),
        }
    }

    pub fn code(&self) -> &[Slot] {
        &self.code
    }

    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// Total input register count from the header.
    pub fn input_count(&self) -> u32 {
        match self.code[0] {
            Slot::Addr(n) => n,
            _ => 0,
        }
    }

    /// Entry instruction index from the header.
    pub fn entry(&self) -> u32 {
        match self.code[1] {
            Slot::Addr(n) => n,
            _ => 0,
        }
    }

    pub(crate) fn set_input_count(&mut self, n: u32) {
        self.code[0] = Slot::Addr(n);
    }

    pub(crate) fn set_entry(&mut self, index: u32) {
        self.code[1] = Slot::Addr(index);
    }

    /// Serialize to the fixed-stride binary form: one tag byte and a
    /// little-endian u32 payload per slot.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() * 5);
        for slot in &self.code {
            match *slot {
                Slot::Op(op) => {
                    out.push(0);
                    out.extend_from_slice(&(op as u8 as u32).to_le_bytes());
                }
                Slot::Addr(a) => {
                    out.push(1);
                    out.extend_from_slice(&a.to_le_bytes());
                }
                Slot::Imm(v) => {
                    out.push(2);
                    out.extend_from_slice(&v.to_bits().to_le_bytes());
                }
            }
        }
        out
    }

    /// Deserialize a stream produced by [`to_bytes`]. Input metadata is
    /// not part of the stream, so `inputs` is empty. Returns `None` for
    /// truncated or malformed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<ShaderProgram> {
        if bytes.len() % 5 != 0 || bytes.len() < Self::HEADER_SLOTS * 5 {
            return None;
        }
        let mut code = Vec::with_capacity(bytes.len() / 5);
        for chunk in bytes.chunks_exact(5) {
            let payload = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
            let slot = match chunk[0] {
                0 => Slot::Op(OpCode::from_u8(payload as u8)?),
                1 => Slot::Addr(payload),
                2 => Slot::Imm(f32::from_bits(payload)),
                _ => return None,
            };
            code.push(slot);
        }
        Some(ShaderProgram {
            code,
            inputs: Vec::new(),
        })
    }

    /// Human-readable instruction listing.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "; inputs: {}  entry: {:04}",
            self.input_count(),
            self.entry()
        );
        let mut ip = Self::HEADER_SLOTS;
        while ip < self.code.len() {
            let op = match self.code[ip] {
                Slot::Op(op) => op,
                other => {
                    let _ = writeln!(out, "{:04}  ?? {:?}", ip, other);
                    ip += 1;
                    continue;
                }
            };
            let _ = write!(out, "{:04}  {}", ip, op.mnemonic());
            let (addrs, imm) = op.operands();
            ip += 1;
            for i in 0..addrs {
                match self.code.get(ip) {
                    Some(Slot::Addr(a)) => {
                        let sep = if i == 0 { "  " } else { ", " };
                        let _ = write!(out, "{}@{}", sep, a);
                    }
                    other => {
                        let _ = write!(out, "  ??{:?}", other);
                    }
                }
                ip += 1;
            }
            if imm {
                match self.code.get(ip) {
                    Some(Slot::Imm(v)) => {
                        let _ = write!(out, ", {}", v);
                    }
                    other => {
                        let _ = write!(out, ", ??{:?}", other);
                    }
                }
                ip += 1;
            }
            out.push('\n');
        }
        out
    }

    /// Count occurrences of an opcode; handy in tests.
    pub fn count_op(&self, op: OpCode) -> usize {
        self.code
            .iter()
            .filter(|s| matches!(s, Slot::Op(o) if *o == op))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_widths_are_consistent() {
        assert_eq!(OpCode::End.operands(), (0, false));
        assert_eq!(OpCode::Push.operands(), (1, false));
        assert_eq!(OpCode::AddRr.operands(), (2, false));
        assert_eq!(OpCode::MsetRi.operands(), (1, true));
    }

    #[test]
    fn test_header_accessors() {
        let mut p = ShaderProgram::new();
        p.set_input_count(3);
        p.set_entry(7);
        assert_eq!(p.input_count(), 3);
        assert_eq!(p.entry(), 7);
    }

    #[test]
    fn test_serialized_stream_round_trips() {
        let mut p = ShaderProgram::new();
        p.set_input_count(2);
        p.set_entry(2);
        p.code.push(Slot::Op(OpCode::Push));
        p.code.push(Slot::Addr(1));
        p.code.push(Slot::Op(OpCode::SetRi));
        p.code.push(Slot::Addr(1));
        p.code.push(Slot::Imm(1.5));
        p.code.push(Slot::Op(OpCode::End));

        let bytes = p.to_bytes();
        let back = ShaderProgram::from_bytes(&bytes).unwrap();
        assert_eq!(back.code, p.code);

        assert!(ShaderProgram::from_bytes(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_disassembly_lists_operands() {
        let mut p = ShaderProgram::new();
        p.set_entry(2);
        p.code.push(Slot::Op(OpCode::AddRi));
        p.code.push(Slot::Addr(1));
        p.code.push(Slot::Imm(2.0));
        p.code.push(Slot::Op(OpCode::End));
        let text = p.disassemble();
        assert!(text.contains("add.ri"), "{}", text);
        assert!(text.contains("@1"), "{}", text);
        assert!(text.contains("end"), "{}", text);
    }
}
