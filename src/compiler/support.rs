//! Runtime support routines.
//!
//! These are the bodies behind truthiness, equality, the spaceship, and the
//! array/hash primitives: short stretches of IR emitted at most once per
//! program and reached by `CALL`. They own a handful of statically
//! allocated scratch cells; none of them ever touches user locals, so call
//! sites skip the save/restore protocol when the target is one of these.
//!
//! Stack conventions follow the calling convention everywhere: arguments in
//! source order with the receiver on top, one result left behind. Comments
//! on the right of each emission track the stack, receiver-last.

use crate::ir::Instruction::{
    Add, Discard, Dup, Mod, Mul, Retrieve, Return, Store, Sub, Swap,
};

use super::value::{ClassId, HASH_BUCKETS, NIL, NONE, NONE_ADDR, TAG_HASH};
use super::{Compiler, Owner};

/// Every routine the compiler can materialize. `ArrayGrow` and
/// `HashKeyToAddr` are internal; the rest back dispatch-table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportRoutine {
    /// `[v] -> [0|1]`: 0 for truthy, 1 for falsy. Nil and false are the
    /// only falsy values.
    Rtest,
    /// `[a, b] -> [TRUE|FALSE]`: wrapped equality by subtraction.
    Req,
    /// `[v] -> [TRUE|FALSE]`: logical not via `Rtest`.
    Rnot,
    /// Integer#<=>: `[other, self] -> [-1|0|+1]` wrapped.
    Cmp,
    ArraySize,
    ArrayPush,
    ArrayPop,
    ArrayGet,
    ArraySet,
    /// Doubles an array's capacity into a fresh block: `[recv] -> []`.
    ArrayGrow,
    /// Bucket-chain probe: `[key, recv] -> [prev, target]`.
    HashKeyToAddr,
    HashGet,
    HashSet,
    /// Allocates and blanks an 11-bucket table: `[] -> [hash]`.
    HashNew,
}

/// The primitive backing `(owner, name)`, with its arity, when no user
/// definition claims the slot.
pub(crate) fn builtin_for(owner: Owner, name: &str) -> Option<(SupportRoutine, usize)> {
    match owner? {
        ClassId::Integer => match name {
            "<=>" => Some((SupportRoutine::Cmp, 1)),
            _ => None,
        },
        ClassId::Array => match name {
            "size" => Some((SupportRoutine::ArraySize, 0)),
            "push" => Some((SupportRoutine::ArrayPush, 1)),
            "pop" => Some((SupportRoutine::ArrayPop, 0)),
            "[]" => Some((SupportRoutine::ArrayGet, 1)),
            "[]=" => Some((SupportRoutine::ArraySet, 2)),
            _ => None,
        },
        ClassId::Hash => match name {
            "[]" => Some((SupportRoutine::HashGet, 1)),
            "[]=" => Some((SupportRoutine::HashSet, 2)),
            _ => None,
        },
    }
}

impl Compiler {
    pub(crate) fn emit_support(&mut self, routine: SupportRoutine, label: i64) {
        match routine {
            SupportRoutine::Rtest => self.emit_rtest(label),
            SupportRoutine::Req => self.emit_req(label),
            SupportRoutine::Rnot => self.emit_rnot(label),
            SupportRoutine::Cmp => self.emit_cmp(label),
            SupportRoutine::ArraySize => self.emit_array_size(label),
            SupportRoutine::ArrayPush => self.emit_array_push(label),
            SupportRoutine::ArrayPop => self.emit_array_pop(label),
            SupportRoutine::ArrayGet => self.emit_array_get(label),
            SupportRoutine::ArraySet => self.emit_array_set(label),
            SupportRoutine::ArrayGrow => self.emit_array_grow(label),
            SupportRoutine::HashKeyToAddr => self.emit_key_to_addr(label),
            SupportRoutine::HashGet => self.emit_hash_get(label),
            SupportRoutine::HashSet => self.emit_hash_set(label),
            SupportRoutine::HashNew => self.emit_hash_new(label),
        }
    }

    fn emit_rtest(&mut self, label: i64) {
        let l_nil = self.new_label();
        let l_falsy = self.new_label();
        self.mark(label); //              [v]
        self.emit(Dup);
        self.push_i(NIL);
        self.emit(Sub);
        self.jump_zero(l_nil); //         [v]
        self.jump_zero(l_falsy); //       [] taken when v == FALSE
        self.push_i(0);
        self.emit(Return);
        self.mark(l_nil);
        self.emit(Discard);
        self.mark(l_falsy);
        self.push_i(1);
        self.emit(Return);
    }

    fn emit_req(&mut self, label: i64) {
        let l_equal = self.new_label();
        self.mark(label); //              [a, b]
        self.emit(Sub); //                [a - b]
        self.jump_zero(l_equal);
        self.push_i(super::value::FALSE);
        self.emit(Return);
        self.mark(l_equal);
        self.push_i(super::value::TRUE);
        self.emit(Return);
    }

    fn emit_rnot(&mut self, label: i64) {
        let rtest = self.support(SupportRoutine::Rtest);
        let l_truthy = self.new_label();
        self.mark(label); //              [v]
        self.call(rtest); //              [0|1]
        self.jump_zero(l_truthy);
        self.push_i(super::value::TRUE);
        self.emit(Return);
        self.mark(l_truthy);
        self.push_i(super::value::FALSE);
        self.emit(Return);
    }

    /// The spaceship classifies the sign of `self - other`. Subtracting the
    /// wrapped operands scales the difference by four without moving it off
    /// zero, so no unwrapping is needed.
    fn emit_cmp(&mut self, label: i64) {
        let l_zero = self.new_label();
        let l_neg = self.new_label();
        self.mark(label); //              [other, self]
        self.emit(Swap);
        self.emit(Sub); //                [self - other]
        self.emit(Dup);
        self.jump_zero(l_zero);
        self.jump_negative(l_neg);
        self.push_i(5); //                wrap(+1)
        self.emit(Return);
        self.mark(l_zero);
        self.emit(Discard);
        self.push_i(1); //                wrap(0)
        self.emit(Return);
        self.mark(l_neg);
        self.push_i(-3); //               wrap(-1)
        self.emit(Return);
    }

    //===------------------------------------------------------------------===//
    // Arrays
    //===------------------------------------------------------------------===//

    fn emit_array_size(&mut self, label: i64) {
        self.mark(label); //              [recv]
        self.emit_unwrap(); //            [base]
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve); //           [size]
        self.emit_wrap_int();
        self.emit(Return);
    }

    fn emit_array_push(&mut self, label: i64) {
        let grow = self.support(SupportRoutine::ArrayGrow);
        let s_recv = self.new_addr();
        let s_elem = self.new_addr();
        let l_grow = self.new_label();
        let l_store = self.new_label();

        self.mark(label); //              [x, recv]
        self.stash(s_recv); //            [x]
        self.stash(s_elem); //            []
        // Full? size == capacity means the block must grow first.
        self.load(s_recv);
        self.emit_unwrap(); //            [base]
        self.emit(Dup);
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve); //           [base, size]
        self.emit(Swap);
        self.push_i(2);
        self.emit(Add);
        self.emit(Retrieve); //           [size, cap]
        self.emit(Sub);
        self.jump_zero(l_grow); //        []
        self.mark(l_store);
        // heap[block + size] = x
        self.load(s_recv);
        self.emit_unwrap();
        self.emit(Dup);
        self.emit(Retrieve); //           [base, block]
        self.emit(Swap);
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve); //           [block, size]
        self.emit(Add); //                [block + size]
        self.load(s_elem);
        self.emit(Store);
        // size += 1
        self.load(s_recv);
        self.emit_unwrap();
        self.push_i(1);
        self.emit(Add); //                [size_addr]
        self.emit(Dup);
        self.emit(Retrieve);
        self.push_i(1);
        self.emit(Add); //                [size_addr, size + 1]
        self.emit(Store);
        // push returns self
        self.load(s_recv);
        self.emit(Return);

        self.mark(l_grow);
        self.load(s_recv);
        self.call(grow);
        self.jump(l_store);
    }

    /// Doubles capacity: bump-allocate a fresh block past HEAP_COUNT, copy
    /// the live elements, rewrite the descriptor's pointer and capacity.
    /// The old cells are abandoned.
    fn emit_array_grow(&mut self, label: i64) {
        let g_base = self.new_addr();
        let g_src = self.new_addr();
        let g_dst = self.new_addr();
        let g_count = self.new_addr();
        let l_copy = self.new_label();
        let l_done = self.new_label();

        self.mark(label); //              [recv]
        self.emit_unwrap();
        self.stash(g_base); //            []
        // count = size, src = old block
        self.push_i(g_count);
        self.load(g_base);
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve);
        self.emit(Store);
        self.push_i(g_src);
        self.load(g_base);
        self.emit(Retrieve);
        self.emit(Store);
        // new capacity = 2 * cap, written back to the descriptor
        self.load(g_base);
        self.push_i(2);
        self.emit(Add);
        self.emit(Retrieve);
        self.push_i(2);
        self.emit(Mul); //                [ncap]
        self.emit(Dup);
        self.load(g_base);
        self.push_i(2);
        self.emit(Add);
        self.emit(Swap);
        self.emit(Store); //              [ncap]
        // allocate ncap cells; dst = first of the new block
        self.load(super::value::HEAP_COUNT);
        self.emit(Add); //                [new_last]
        self.emit(Dup);
        self.push_i(super::value::HEAP_COUNT);
        self.emit(Swap);
        self.emit(Store); //              [new_last]
        self.load(g_base);
        self.push_i(2);
        self.emit(Add);
        self.emit(Retrieve); //           [new_last, ncap]
        self.emit(Sub);
        self.push_i(1);
        self.emit(Add); //                [first]
        self.stash(g_dst);
        // descriptor's element pointer moves to the new block
        self.load(g_base);
        self.load(g_dst);
        self.emit(Store);
        // copy loop
        self.mark(l_copy);
        self.load(g_count);
        self.jump_zero(l_done);
        self.load(g_dst);
        self.load(g_src);
        self.emit(Retrieve);
        self.emit(Store);
        self.push_i(g_src);
        self.load(g_src);
        self.push_i(1);
        self.emit(Add);
        self.emit(Store);
        self.push_i(g_dst);
        self.load(g_dst);
        self.push_i(1);
        self.emit(Add);
        self.emit(Store);
        self.push_i(g_count);
        self.load(g_count);
        self.push_i(1);
        self.emit(Sub);
        self.emit(Store);
        self.jump(l_copy);
        self.mark(l_done);
        self.emit(Return);
    }

    fn emit_array_pop(&mut self, label: i64) {
        let p_index = self.new_addr();
        let l_empty = self.new_label();

        self.mark(label); //              [recv]
        self.emit_unwrap(); //            [base]
        self.emit(Dup);
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve); //           [base, size]
        self.jump_zero(l_empty); //       [base]
        self.emit(Dup);
        self.push_i(1);
        self.emit(Add); //                [base, size_addr]
        self.emit(Dup);
        self.emit(Retrieve);
        self.push_i(1);
        self.emit(Sub); //                [base, size_addr, size - 1]
        self.emit(Dup);
        self.stash(p_index); //           [base, size_addr, size - 1]
        self.emit(Store); //              [base]
        self.emit(Retrieve); //           [block]
        self.load(p_index);
        self.emit(Add);
        self.emit(Retrieve);
        self.emit(Return);
        self.mark(l_empty);
        self.emit(Discard);
        self.push_i(NIL);
        self.emit(Return);
    }

    // TODO: bounds-check reads and writes against the descriptor's size
    // instead of trusting the index.
    fn emit_array_get(&mut self, label: i64) {
        self.mark(label); //              [i, recv]
        self.emit_unwrap(); //            [i, base]
        self.emit(Retrieve); //           [i, block]
        self.emit(Swap);
        self.emit_unwrap(); //            [block, i']
        self.emit(Add);
        self.emit(Retrieve);
        self.emit(Return);
    }

    fn emit_array_set(&mut self, label: i64) {
        let s_block = self.new_addr();
        let s_value = self.new_addr();
        self.mark(label); //              [i, v, recv]
        self.emit_unwrap();
        self.emit(Retrieve); //           [i, v, block]
        self.stash(s_block); //           [i, v]
        self.stash(s_value); //           [i]
        self.emit_unwrap(); //            [i']
        self.load(s_block);
        self.emit(Add); //                [block + i']
        self.load(s_value);
        self.emit(Store);
        // assignment yields the stored value
        self.load(s_value);
        self.emit(Return);
    }

    //===------------------------------------------------------------------===//
    // Hashes
    //===------------------------------------------------------------------===//

    fn emit_hash_new(&mut self, label: i64) {
        let n_bucket = self.new_addr();
        let n_left = self.new_addr();
        let l_blank = self.new_label();
        let l_done = self.new_label();

        self.mark(label); //              []
        self.emit_alloc(HASH_BUCKETS * 3); // [first]
        self.emit(Dup);
        self.stash(n_bucket); //          [first]
        self.push_i(n_left);
        self.push_i(HASH_BUCKETS);
        self.emit(Store);
        // Blank every bucket: key = NONE, next = NONE_ADDR. A key of NONE
        // marks the bucket empty; values stay whatever the heap holds.
        self.mark(l_blank);
        self.load(n_left);
        self.jump_zero(l_done);
        self.load(n_bucket);
        self.push_i(NONE);
        self.emit(Store);
        self.load(n_bucket);
        self.push_i(2);
        self.emit(Add);
        self.push_i(NONE_ADDR);
        self.emit(Store);
        self.push_i(n_bucket);
        self.load(n_bucket);
        self.push_i(3);
        self.emit(Add);
        self.emit(Store);
        self.push_i(n_left);
        self.load(n_left);
        self.push_i(1);
        self.emit(Sub);
        self.emit(Store);
        self.jump(l_blank);
        self.mark(l_done); //             [first]
        self.push_i(4);
        self.emit(Mul);
        self.push_i(TAG_HASH);
        self.emit(Add);
        self.emit(Return);
    }

    /// The core of every hash operation. Probes the chain starting at the
    /// key's bucket until the key matches, an empty bucket appears, or the
    /// chain ends; leaves `[prev, target]` where prev is NONE_ADDR for a
    /// head-bucket hit.
    fn emit_key_to_addr(&mut self, label: i64) {
        let h_key = self.new_addr();
        let h_prev = self.new_addr();
        self.hash_cells = Some((h_key, h_prev));
        let l_probe = self.new_label();
        let l_found = self.new_label();

        self.mark(label); //              [key, recv]
        self.emit_unwrap(); //            [key, base]
        self.emit(Swap);
        self.stash(h_key); //             [base]
        self.push_i(h_prev);
        self.push_i(NONE_ADDR);
        self.emit(Store);
        // target = base + 3 * (key' mod buckets); flooring mod keeps the
        // index in range for negative keys.
        self.load(h_key);
        self.emit_unwrap();
        self.push_i(HASH_BUCKETS);
        self.emit(Mod);
        self.push_i(3);
        self.emit(Mul);
        self.emit(Add); //                [target]
        self.mark(l_probe);
        self.emit(Dup);
        self.emit(Retrieve);
        self.load(h_key);
        self.emit(Sub);
        self.jump_zero(l_found); //       key hit
        self.emit(Dup);
        self.emit(Retrieve);
        self.push_i(NONE);
        self.emit(Sub);
        self.jump_zero(l_found); //       empty bucket in the chain
        self.emit(Dup);
        self.push_i(2);
        self.emit(Add);
        self.emit(Retrieve);
        self.jump_zero(l_found); //       chain end
        self.emit(Dup);
        self.stash(h_prev);
        self.push_i(2);
        self.emit(Add);
        self.emit(Retrieve);
        self.jump(l_probe);
        self.mark(l_found); //            [target]
        self.load(h_prev);
        self.emit(Swap);
        self.emit(Return);
    }

    fn emit_hash_get(&mut self, label: i64) {
        let key_to_addr = self.support(SupportRoutine::HashKeyToAddr);
        let (h_key, _) = self.hash_cells.expect("key_to_addr fills the cells");
        let l_miss = self.new_label();
        let l_hit = self.new_label();

        self.mark(label); //              [key, recv]
        self.call(key_to_addr); //        [prev, target]
        self.emit(Swap);
        self.emit(Discard); //            [target]
        self.emit(Dup);
        self.emit(Retrieve);
        self.push_i(NONE);
        self.emit(Sub);
        self.jump_zero(l_miss);
        self.emit(Dup);
        self.emit(Retrieve);
        self.load(h_key);
        self.emit(Sub);
        self.jump_zero(l_hit);
        self.mark(l_miss); //             chain-terminated miss falls through
        self.emit(Discard);
        self.push_i(NIL);
        self.emit(Return);
        self.mark(l_hit);
        self.push_i(1);
        self.emit(Add);
        self.emit(Retrieve);
        self.emit(Return);
    }

    fn emit_hash_set(&mut self, label: i64) {
        let key_to_addr = self.support(SupportRoutine::HashKeyToAddr);
        let (h_key, _) = self.hash_cells.expect("key_to_addr fills the cells");
        let s_recv = self.new_addr();
        let s_value = self.new_addr();
        let s_bucket = self.new_addr();
        let l_claim = self.new_label();
        let l_value = self.new_label();

        self.mark(label); //              [key, v, recv]
        self.stash(s_recv); //            [key, v]
        self.stash(s_value); //           [key]
        self.load(s_recv); //             [key, recv]
        self.call(key_to_addr); //        [prev, target]
        self.emit(Swap);
        self.emit(Discard); //            [target]
        self.emit(Dup);
        self.emit(Retrieve);
        self.load(h_key);
        self.emit(Sub);
        self.jump_zero(l_value); //       key present: overwrite the value
        self.emit(Dup);
        self.emit(Retrieve);
        self.push_i(NONE);
        self.emit(Sub);
        self.jump_zero(l_claim); //       empty bucket: claim it
        // Terminal mismatch: wire in a fresh extension bucket.
        self.emit_alloc(3); //            [target, fresh]
        self.stash(s_bucket); //          [target]
        self.push_i(2);
        self.emit(Add);
        self.load(s_bucket);
        self.emit(Store); //              [] target's next -> fresh
        self.load(s_bucket); //           [fresh]
        self.emit(Dup);
        self.push_i(2);
        self.emit(Add);
        self.push_i(NONE_ADDR);
        self.emit(Store); //              [fresh] terminator invariant
        self.mark(l_claim); //            [bucket]
        self.emit(Dup);
        self.load(h_key);
        self.emit(Store); //              [bucket] key cell written
        self.mark(l_value); //            [bucket]
        self.push_i(1);
        self.emit(Add);
        self.load(s_value);
        self.emit(Store);
        self.load(s_value);
        self.emit(Return);
    }
}

#[cfg(test)]
mod tests {
    use super::super::Compiler;
    use super::*;
    use crate::ir::Instruction;
    use num_bigint::BigInt;

    #[test]
    fn routines_are_emitted_once() {
        let mut compiler = Compiler::new();
        let first = compiler.support(SupportRoutine::Rtest);
        let second = compiler.support(SupportRoutine::Rtest);
        assert_eq!(first, second);
        let marks = compiler
            .defs
            .iter()
            .filter(|i| matches!(i, Instruction::Mark(l) if *l == BigInt::from(first)))
            .count();
        assert_eq!(marks, 1);
    }

    #[test]
    fn rnot_pulls_in_rtest() {
        let mut compiler = Compiler::new();
        let rnot = compiler.support(SupportRoutine::Rnot);
        let rtest = compiler.support(SupportRoutine::Rtest);
        assert_ne!(rnot, rtest);
        assert!(compiler
            .defs
            .iter()
            .any(|i| matches!(i, Instruction::Call(l) if *l == BigInt::from(rtest))));
    }

    #[test]
    fn hash_accessors_share_the_probe() {
        let mut compiler = Compiler::new();
        let get = compiler.support(SupportRoutine::HashGet);
        let set = compiler.support(SupportRoutine::HashSet);
        assert_ne!(get, set);
        let probe = compiler.support(SupportRoutine::HashKeyToAddr);
        let calls = compiler
            .defs
            .iter()
            .filter(|i| matches!(i, Instruction::Call(l) if *l == BigInt::from(probe)))
            .count();
        assert_eq!(calls, 2);
    }

    #[test]
    fn builtins_cover_the_primitive_surface() {
        use super::super::value::ClassId::*;
        assert!(builtin_for(Some(Integer), "<=>").is_some());
        for name in ["size", "push", "pop", "[]", "[]="] {
            assert!(builtin_for(Some(Array), name).is_some(), "Array#{}", name);
        }
        for name in ["[]", "[]="] {
            assert!(builtin_for(Some(Hash), name).is_some(), "Hash#{}", name);
        }
        assert!(builtin_for(None, "size").is_none());
        assert!(builtin_for(Some(Integer), "size").is_none());
    }
}
