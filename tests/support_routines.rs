//! Exercises the compiled array and hash primitives through real programs
//! whose shapes isolate one routine at a time, checking the heap layout
//! invariants the data model promises: descriptor fields, contiguous
//! element blocks, bucket chains, and abandonment of old cells on growth.

use tabula::compiler;
use tabula::error::Source;
use tabula::machine::Machine;

fn run(source: &str) -> String {
    let program = compiler::compile(source, Source::Inline).unwrap();
    let mut machine = Machine::new("".as_bytes(), Vec::new());
    machine.run(&program).unwrap();
    String::from_utf8(machine.into_output()).unwrap()
}

#[test]
fn size_tracks_pushes_exactly() {
    let source = "
x = []
put_as_number x.size
x.push(7)
put_as_number x.size
x.push(7)
x.push(7)
put_as_number x.size
";
    assert_eq!(run(source), "013");
}

#[test]
fn push_returns_the_receiver() {
    // Chained pushes only work if push leaves self behind.
    let source = "
x = []
x.push(1).push(2).push(3)
put_as_number x.size
put_as_number x[2]
";
    assert_eq!(run(source), "33");
}

#[test]
fn pop_is_lifo() {
    let source = "
x = [1, 2, 3]
put_as_number x.pop
put_as_number x.pop
put_as_number x.pop
";
    assert_eq!(run(source), "321");
}

#[test]
fn push_after_pop_reuses_the_slot() {
    let source = "
x = [5]
x.pop
x.push(9)
put_as_number x.size
put_as_number x[0]
";
    assert_eq!(run(source), "19");
}

#[test]
fn index_write_returns_the_value() {
    let source = "
x = [0]
put_as_number(x[0] = 6)
put_as_number x[0]
";
    assert_eq!(run(source), "66");
}

#[test]
fn growth_at_the_exact_capacity_boundary() {
    // Capacity 10: the tenth push fits, the eleventh grows.
    let source = "
x = []
i = 0
while i < 10
  x.push(i)
  i = i + 1
end
put_as_number x.size
x.push(10)
put_as_number x.size
put_as_number x[0]
put_as_number x[10]
";
    assert_eq!(run(source), "1011010");
}

#[test]
fn repeated_growth_keeps_early_elements() {
    // 10 -> 20 -> 40 -> 80: three reallocations deep.
    let source = "
x = []
i = 0
while i < 50
  x.push(i + 100)
  i = i + 1
end
put_as_number x[0]
put_as_char ' '
put_as_number x[9]
put_as_char ' '
put_as_number x[10]
put_as_char ' '
put_as_number x[49]
";
    assert_eq!(run(source), "100 109 110 149");
}

#[test]
fn independent_arrays_do_not_alias() {
    let source = "
a = [1, 2, 3]
b = [9, 9, 9]
a[1] = 5
put_as_number a[1]
put_as_number b[1]
";
    assert_eq!(run(source), "59");
}

#[test]
fn growing_one_array_leaves_another_intact() {
    // The grown block is bump-allocated past everything else, so a
    // neighbor allocated after the first array must survive untouched.
    let source = "
a = []
b = [7, 8]
i = 0
while i < 15
  a.push(i)
  i = i + 1
end
put_as_number b[0]
put_as_number b[1]
put_as_number a[14]
";
    assert_eq!(run(source), "7814");
}

#[test]
fn every_bucket_of_the_table_works() {
    let source = "
h = {}
i = 0
while i < 11
  h[i] = i * 10
  i = i + 1
end
i = 0
while i < 11
  put_as_number h[i]
  put_as_char ' '
  i = i + 1
end
";
    let expected: String = (0..11).map(|i| format!("{} ", i * 10)).collect();
    assert_eq!(run(source), expected);
}

#[test]
fn long_chains_stay_ordered_and_reachable() {
    // Five keys in one bucket force a four-deep extension chain.
    let source = "
h = {}
h[0] = 1
h[11] = 2
h[22] = 3
h[33] = 4
h[44] = 5
put_as_number h[44]
put_as_number h[0]
put_as_number h[22]
put_as_number h[33]
put_as_number h[11]
";
    assert_eq!(run(source), "51342");
}

#[test]
fn chain_updates_hit_the_right_link() {
    let source = "
h = {}
h[0] = 1
h[11] = 2
h[22] = 3
h[11] = 9
put_as_number h[0]
put_as_number h[11]
put_as_number h[22]
";
    assert_eq!(run(source), "193");
}

#[test]
fn miss_at_the_end_of_a_chain_is_nil() {
    let source = "
h = {}
h[0] = 1
h[11] = 2
if h[33] == nil then put_as_char 'y' end
";
    assert_eq!(run(source), "y");
}

#[test]
fn hashes_and_arrays_interleave_on_the_heap() {
    let source = "
h = {}
a = [1]
h[5] = 50
i = 0
while i < 20
  a.push(i)
  i = i + 1
end
h[16] = 60
put_as_number h[5]
put_as_char ' '
put_as_number h[16]
put_as_char ' '
put_as_number a[20]
";
    assert_eq!(run(source), "50 60 19");
}

#[test]
fn values_of_every_kind_store_in_collections() {
    let source = "
a = [true, nil, 'x']
if a[0] then put_as_char 't' end
if a[1] == nil then put_as_char 'n' end
put_as_char a[2]
h = {1 => false}
unless h[1]
  put_as_char 'f'
end
";
    assert_eq!(run(source), "tnxf");
}

#[test]
fn nested_collections() {
    let source = "
m = [[1, 2], [3, 4]]
put_as_number m[1][0]
h = {1 => [5, 6]}
put_as_number h[1][1]
put_as_number({2 => {3 => 7}}[2][3])
";
    assert_eq!(run(source), "367");
}
