//! Register-stack virtual machine over SIMD-wide float lanes.
//!
//! Execution is a plain fetch-decode-execute loop with three pieces of
//! state beyond the register stack: the current lane mask, the mask
//! stack (one saved mask per nested conditional), and a staged test
//! register that comparisons write and `test.and`/`test.or` fold into
//! the mask. Both branches of a conditional execute; predicated stores
//! (`mset.*`) make only the masked lanes visible.
//!
//! The VM is fail-fast: malformed streams (bad operand slots, stack
//! over/underflow, running off the end without `end`) abort with a
//! `false` return and no diagnostics, since a well-formed compile can
//! never produce them.
//!
//! Each [`ShaderProgram::run`] call owns its register stack and touches
//! only the [`InputArrays`] passed to it, so independent callers may run
//! one VM instance per thread over disjoint fragment blocks.

use crate::bytecode::{OpCode, ShaderProgram, Slot};
use std::ops::{Add, BitAnd, BitOr, Div, Mul, Not, Sub};

/// Number of SIMD lanes processed in lockstep.
pub const LANES: usize = 4;

/// Register-stack capacity in slots. Exceeding it is a hard VM failure,
/// not a wraparound.
pub const STACK_SLOTS: usize = 512;

/// One register slot: a float per lane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WideFloat(pub [f32; LANES]);

impl WideFloat {
    pub fn splat(v: f32) -> Self {
        WideFloat([v; LANES])
    }

    pub fn lane(&self, i: usize) -> f32 {
        self.0[i]
    }

    fn zip(self, rhs: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        let mut out = [0.0; LANES];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(self.0[i], rhs.0[i]);
        }
        WideFloat(out)
    }

    fn cmp(self, rhs: Self, f: impl Fn(f32, f32) -> bool) -> WideMask {
        let mut out = [false; LANES];
        for (i, lane) in out.iter_mut().enumerate() {
            *lane = f(self.0[i], rhs.0[i]);
        }
        WideMask(out)
    }

    pub fn eq_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a == b)
    }

    pub fn ne_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a != b)
    }

    pub fn lt_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a < b)
    }

    pub fn le_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a <= b)
    }

    pub fn gt_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a > b)
    }

    pub fn ge_lanes(self, rhs: Self) -> WideMask {
        self.cmp(rhs, |a, b| a >= b)
    }
}

impl Add for WideFloat {
    type Output = WideFloat;
    fn add(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a + b)
    }
}

impl Sub for WideFloat {
    type Output = WideFloat;
    fn sub(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a - b)
    }
}

impl Mul for WideFloat {
    type Output = WideFloat;
    fn mul(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a * b)
    }
}

impl Div for WideFloat {
    type Output = WideFloat;
    fn div(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a / b)
    }
}

/// One boolean per lane; the mask and test registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WideMask(pub [bool; LANES]);

impl WideMask {
    pub fn splat(v: bool) -> Self {
        WideMask([v; LANES])
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|&b| b)
    }

    pub fn all(&self) -> bool {
        self.0.iter().all(|&b| b)
    }

    /// Per-lane predicated select: `on` where the mask is set, `off`
    /// elsewhere.
    pub fn select(self, on: WideFloat, off: WideFloat) -> WideFloat {
        let mut out = [0.0; LANES];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if self.0[i] { on.0[i] } else { off.0[i] };
        }
        WideFloat(out)
    }
}

impl Default for WideMask {
    fn default() -> Self {
        WideMask::splat(true)
    }
}

impl BitAnd for WideMask {
    type Output = WideMask;
    fn bitand(self, rhs: Self) -> Self {
        let mut out = [false; LANES];
        for (i, lane) in out.iter_mut().enumerate() {
            *lane = self.0[i] & rhs.0[i];
        }
        WideMask(out)
    }
}

impl BitOr for WideMask {
    type Output = WideMask;
    fn bitor(self, rhs: Self) -> Self {
        let mut out = [false; LANES];
        for (i, lane) in out.iter_mut().enumerate() {
            *lane = self.0[i] | rhs.0[i];
        }
        WideMask(out)
    }
}

impl Not for WideMask {
    type Output = WideMask;
    fn not(self) -> Self {
        let mut out = [false; LANES];
        for (i, lane) in out.iter_mut().enumerate() {
            *lane = !self.0[i];
        }
        WideMask(out)
    }
}

/// The three named register blocks the rasterizer hands to a program:
/// uniforms, per-fragment interpolated inputs, and read/write fragment
/// registers that are merged back under the fragment mask on `end`.
#[derive(Debug)]
pub struct InputArrays<'a> {
    pub constant: &'a [WideFloat],
    pub varying: &'a [WideFloat],
    pub fragments: &'a mut [WideFloat],
}

impl InputArrays<'_> {
    pub fn total_count(&self) -> usize {
        self.constant.len() + self.varying.len() + self.fragments.len()
    }
}

struct Machine {
    stack: Vec<WideFloat>,
    sp: usize,
    mask: WideMask,
    mask_stack: Vec<WideMask>,
    test: WideMask,
}

impl Machine {
    fn new() -> Self {
        Machine {
            stack: vec![WideFloat::default(); STACK_SLOTS],
            sp: 0,
            mask: WideMask::splat(true),
            mask_stack: Vec::new(),
            test: WideMask::splat(false),
        }
    }

    /// Resolve an offset back from the stack pointer to an absolute
    /// slot index. Offset zero and offsets past the bottom are invalid.
    fn index(&self, off: u32) -> Option<usize> {
        let off = off as usize;
        if off == 0 || off > self.sp {
            None
        } else {
            Some(self.sp - off)
        }
    }

    fn get(&self, off: u32) -> Option<WideFloat> {
        self.index(off).map(|i| self.stack[i])
    }

    fn set(&mut self, off: u32, v: WideFloat) -> Option<()> {
        let i = self.index(off)?;
        self.stack[i] = v;
        Some(())
    }

    fn push(&mut self, n: u32) -> Option<()> {
        let n = n as usize;
        if self.sp + n > STACK_SLOTS {
            return None;
        }
        for slot in &mut self.stack[self.sp..self.sp + n] {
            *slot = WideFloat::default();
        }
        self.sp += n;
        Some(())
    }

    fn pop(&mut self, n: u32) -> Option<()> {
        let n = n as usize;
        if n > self.sp {
            return None;
        }
        self.sp -= n;
        Some(())
    }
}

impl ShaderProgram {
    /// Check the caller's register blocks against the program's declared
    /// input count. Calling [`run`] with a mismatched count is a caller
    /// contract violation; `run` refuses it rather than aliasing slots.
    ///
    /// [`run`]: ShaderProgram::run
    pub fn is_valid(&self, input: &InputArrays) -> bool {
        input.total_count() == self.input_count() as usize
    }

    /// Execute the program over one fragment block. Returns `false` on
    /// any malformed-stream condition; on success only the fragment
    /// lanes selected by `frag_mask` have been written back.
    pub fn run(&self, input: &mut InputArrays, frag_mask: WideMask) -> bool {
        if !self.is_valid(input) || input.total_count() > STACK_SLOTS {
            return false;
        }

        let mut machine = Machine::new();
        let mut at = 0;
        for &slot in input.constant.iter().chain(input.varying.iter()) {
            machine.stack[at] = slot;
            at += 1;
        }
        for &slot in input.fragments.iter() {
            machine.stack[at] = slot;
            at += 1;
        }
        machine.sp = at;

        self.exec(&mut machine, input, frag_mask).is_some()
    }

    fn exec(
        &self,
        machine: &mut Machine,
        input: &mut InputArrays,
        frag_mask: WideMask,
    ) -> Option<()> {
        let code = self.code();
        let mut ip = self.entry() as usize;

        loop {
            let op = match code.get(ip)? {
                Slot::Op(op) => *op,
                _ => return None,
            };
            ip += 1;

            match op {
                OpCode::End => {
                    let base = input.constant.len() + input.varying.len();
                    for (j, frag) in input.fragments.iter_mut().enumerate() {
                        *frag = frag_mask.select(machine.stack[base + j], *frag);
                    }
                    return Some(());
                }
                OpCode::Push => {
                    let n = addr(code, &mut ip)?;
                    machine.push(n)?;
                }
                OpCode::Pop => {
                    let n = addr(code, &mut ip)?;
                    machine.pop(n)?;
                }
                OpCode::Jmp => {
                    ip = addr(code, &mut ip)? as usize;
                }
                OpCode::TestJz => {
                    let target = addr(code, &mut ip)?;
                    if !machine.mask.any() {
                        ip = target as usize;
                    }
                }
                OpCode::Return => {
                    let ra = machine.get(1)?.lane(0);
                    machine.pop(1)?;
                    if !(ra.is_finite() && ra >= 0.0) {
                        return None;
                    }
                    ip = ra as usize;
                }
                OpCode::TestPush => machine.mask_stack.push(machine.mask),
                OpCode::TestPop => machine.mask = machine.mask_stack.pop()?,
                OpCode::TestAnd => machine.mask = machine.mask & machine.test,
                OpCode::TestOr => machine.mask = machine.mask | machine.test,
                OpCode::TestInv => {
                    let enclosing = machine
                        .mask_stack
                        .last()
                        .copied()
                        .unwrap_or_else(|| WideMask::splat(true));
                    machine.mask = enclosing & !machine.mask;
                }
                OpCode::SetRr => {
                    let (d, s) = (addr(code, &mut ip)?, addr(code, &mut ip)?);
                    let v = machine.get(s)?;
                    machine.set(d, v)?;
                }
                OpCode::SetRi => {
                    let d = addr(code, &mut ip)?;
                    let v = imm(code, &mut ip)?;
                    machine.set(d, WideFloat::splat(v))?;
                }
                OpCode::MsetRr => {
                    let (d, s) = (addr(code, &mut ip)?, addr(code, &mut ip)?);
                    let v = machine.get(s)?;
                    let old = machine.get(d)?;
                    machine.set(d, machine.mask.select(v, old))?;
                }
                OpCode::MsetRi => {
                    let d = addr(code, &mut ip)?;
                    let v = WideFloat::splat(imm(code, &mut ip)?);
                    let old = machine.get(d)?;
                    machine.set(d, machine.mask.select(v, old))?;
                }
                OpCode::AddRr | OpCode::SubRr | OpCode::MulRr | OpCode::DivRr => {
                    let (d, s) = (addr(code, &mut ip)?, addr(code, &mut ip)?);
                    let a = machine.get(d)?;
                    let b = machine.get(s)?;
                    machine.set(d, arith(op, a, b))?;
                }
                OpCode::AddRi | OpCode::SubRi | OpCode::MulRi | OpCode::DivRi => {
                    let d = addr(code, &mut ip)?;
                    let b = WideFloat::splat(imm(code, &mut ip)?);
                    let a = machine.get(d)?;
                    machine.set(d, arith(op, a, b))?;
                }
                OpCode::EqRr | OpCode::NeRr | OpCode::LtRr | OpCode::LeRr | OpCode::GtRr
                | OpCode::GeRr => {
                    let (l, r) = (addr(code, &mut ip)?, addr(code, &mut ip)?);
                    let a = machine.get(l)?;
                    let b = machine.get(r)?;
                    machine.test = compare(op, a, b);
                }
                OpCode::EqRi | OpCode::NeRi | OpCode::LtRi | OpCode::LeRi | OpCode::GtRi
                | OpCode::GeRi => {
                    let l = addr(code, &mut ip)?;
                    let b = WideFloat::splat(imm(code, &mut ip)?);
                    let a = machine.get(l)?;
                    machine.test = compare(op, a, b);
                }
            }
        }
    }
}

fn arith(op: OpCode, a: WideFloat, b: WideFloat) -> WideFloat {
    match op {
        OpCode::AddRr | OpCode::AddRi => a + b,
        OpCode::SubRr | OpCode::SubRi => a - b,
        OpCode::MulRr | OpCode::MulRi => a * b,
        OpCode::DivRr | OpCode::DivRi => a / b,
        _ => unreachable!(),
    }
}

fn compare(op: OpCode, a: WideFloat, b: WideFloat) -> WideMask {
    match op {
        OpCode::EqRr | OpCode::EqRi => a.eq_lanes(b),
        OpCode::NeRr | OpCode::NeRi => a.ne_lanes(b),
        OpCode::LtRr | OpCode::LtRi => a.lt_lanes(b),
        OpCode::LeRr | OpCode::LeRi => a.le_lanes(b),
        OpCode::GtRr | OpCode::GtRi => a.gt_lanes(b),
        OpCode::GeRr | OpCode::GeRi => a.ge_lanes(b),
        _ => unreachable!(),
    }
}

fn addr(code: &[Slot], ip: &mut usize) -> Option<u32> {
    match code.get(*ip) {
        Some(Slot::Addr(a)) => {
            *ip += 1;
            Some(*a)
        }
        _ => None,
    }
}

fn imm(code: &[Slot], ip: &mut usize) -> Option<f32> {
    match code.get(*ip) {
        Some(Slot::Imm(v)) => {
            *ip += 1;
            Some(*v)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assemble a program: `inputs` register slots, entry right
    /// after the header.
    fn assemble(inputs: u32, body: Vec<Slot>) -> ShaderProgram {
        let mut p = ShaderProgram::new();
        p.set_input_count(inputs);
        p.set_entry(ShaderProgram::HEADER_SLOTS as u32);
        p.code.extend(body);
        p
    }

    fn op(o: OpCode) -> Slot {
        Slot::Op(o)
    }

    #[test]
    fn test_masked_fragment_writeback() {
        let p = assemble(
            1,
            vec![op(OpCode::MsetRi), Slot::Addr(1), Slot::Imm(5.0), op(OpCode::End)],
        );
        let mut frags = [WideFloat::splat(1.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        let mask = WideMask([true, false, true, false]);
        assert!(p.run(&mut input, mask));
        assert_eq!(frags[0], WideFloat([5.0, 1.0, 5.0, 1.0]));
    }

    #[test]
    fn test_divergence_merges_both_branches() {
        // if (v < 0.5) frag = 1.0 else frag = 2.0, hand-assembled.
        let p = assemble(
            2,
            vec![
                op(OpCode::LtRi),
                Slot::Addr(2),
                Slot::Imm(0.5),
                op(OpCode::TestPush),
                op(OpCode::TestAnd),
                op(OpCode::MsetRi),
                Slot::Addr(1),
                Slot::Imm(1.0),
                op(OpCode::TestInv),
                op(OpCode::MsetRi),
                Slot::Addr(1),
                Slot::Imm(2.0),
                op(OpCode::TestPop),
                op(OpCode::End),
            ],
        );
        let varying = [WideFloat([0.0, 1.0, 0.2, 0.9])];
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &varying,
            fragments: &mut frags,
        };
        assert!(p.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat([1.0, 2.0, 1.0, 2.0]));
    }

    #[test]
    fn test_all_true_and_all_false_masks() {
        for (v, expect) in [(0.0f32, 1.0f32), (1.0, 2.0)] {
            let p = assemble(
                2,
                vec![
                    op(OpCode::LtRi),
                    Slot::Addr(2),
                    Slot::Imm(0.5),
                    op(OpCode::TestPush),
                    op(OpCode::TestAnd),
                    op(OpCode::MsetRi),
                    Slot::Addr(1),
                    Slot::Imm(1.0),
                    op(OpCode::TestInv),
                    op(OpCode::MsetRi),
                    Slot::Addr(1),
                    Slot::Imm(2.0),
                    op(OpCode::TestPop),
                    op(OpCode::End),
                ],
            );
            let varying = [WideFloat::splat(v)];
            let mut frags = [WideFloat::splat(0.0)];
            let mut input = InputArrays {
                constant: &[],
                varying: &varying,
                fragments: &mut frags,
            };
            assert!(p.run(&mut input, WideMask::splat(true)));
            assert_eq!(frags[0], WideFloat::splat(expect));
        }
    }

    #[test]
    fn test_arithmetic_ops() {
        // frag = (frag + 3) * 2 - 1, then divided by 2.
        let p = assemble(
            1,
            vec![
                op(OpCode::AddRi),
                Slot::Addr(1),
                Slot::Imm(3.0),
                op(OpCode::MulRi),
                Slot::Addr(1),
                Slot::Imm(2.0),
                op(OpCode::SubRi),
                Slot::Addr(1),
                Slot::Imm(1.0),
                op(OpCode::DivRi),
                Slot::Addr(1),
                Slot::Imm(2.0),
                op(OpCode::End),
            ],
        );
        let mut frags = [WideFloat([0.0, 1.0, 2.0, 3.0])];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        assert!(p.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat([2.5, 3.5, 4.5, 5.5]));
    }

    #[test]
    fn test_running_off_the_end_fails() {
        let p = assemble(0, vec![op(OpCode::TestPush)]);
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut [],
        };
        assert!(!p.run(&mut input, WideMask::splat(true)));
    }

    #[test]
    fn test_operand_slot_mismatch_fails() {
        // `push` expects an address operand, not an opcode.
        let p = assemble(0, vec![op(OpCode::Push), op(OpCode::End)]);
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut [],
        };
        assert!(!p.run(&mut input, WideMask::splat(true)));
    }

    #[test]
    fn test_stack_overflow_is_fatal_not_wrapping() {
        let p = assemble(
            0,
            vec![
                op(OpCode::Push),
                Slot::Addr(STACK_SLOTS as u32 + 1),
                op(OpCode::End),
            ],
        );
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut [],
        };
        assert!(!p.run(&mut input, WideMask::splat(true)));
    }

    #[test]
    fn test_mask_pop_underflow_fails() {
        let p = assemble(0, vec![op(OpCode::TestPop), op(OpCode::End)]);
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut [],
        };
        assert!(!p.run(&mut input, WideMask::splat(true)));
    }

    #[test]
    fn test_input_count_mismatch_is_rejected() {
        let p = assemble(2, vec![op(OpCode::End)]);
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        assert!(!p.is_valid(&input));
        assert!(!p.run(&mut input, WideMask::splat(true)));
    }

    #[test]
    fn test_return_jumps_through_saved_address() {
        // Call-shaped control flow: push a return address, jump to a
        // "function" that writes the fragment and returns.
        let p = assemble(
            1,
            vec![
                op(OpCode::Push), // 2: slot for the return address
                Slot::Addr(1),
                op(OpCode::SetRi), // 4: return address = 9 (the `end`)
                Slot::Addr(1),
                Slot::Imm(9.0),
                op(OpCode::Jmp), // 7: call the function at 10
                Slot::Addr(10),
                op(OpCode::End), // 9: back here after the call
                op(OpCode::MsetRi), // 10: the function body
                Slot::Addr(2),
                Slot::Imm(7.0),
                op(OpCode::Return),
            ],
        );
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        assert!(p.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat::splat(7.0));
    }

    #[test]
    fn test_while_shaped_loop_with_test_jz() {
        // Per-lane loop: while (frag < n) frag += 1. The increment goes
        // through an unmasked temp and a masked store, so lanes that
        // already failed the compare stop advancing while the rest
        // iterate. Slot layout: n at abs 0, frag at abs 1, temp at 2.
        let p = assemble(
            2,
            vec![
                op(OpCode::TestPush), // 2
                op(OpCode::Push),     // 3: temp slot
                Slot::Addr(1),
                op(OpCode::LtRr), // 5: loop head, test = frag < n
                Slot::Addr(2),
                Slot::Addr(3),
                op(OpCode::TestAnd), // 8
                op(OpCode::TestJz),  // 9
                Slot::Addr(22),
                op(OpCode::SetRr), // 11: temp = frag
                Slot::Addr(1),
                Slot::Addr(2),
                op(OpCode::AddRi), // 14: temp += 1
                Slot::Addr(1),
                Slot::Imm(1.0),
                op(OpCode::MsetRr), // 17: frag = temp, masked
                Slot::Addr(2),
                Slot::Addr(1),
                op(OpCode::Jmp), // 20
                Slot::Addr(5),
                op(OpCode::Pop), // 22: exit
                Slot::Addr(1),
                op(OpCode::TestPop), // 24
                op(OpCode::End),     // 25
            ],
        );
        let varying = [WideFloat([0.0, 1.0, 2.0, 3.0])];
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &varying,
            fragments: &mut frags,
        };
        assert!(p.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat([0.0, 1.0, 2.0, 3.0]));
    }
}
