//! The dialect prelude.
//!
//! A short rasa program registered before every user program. It only
//! reopens the built-in classes, so it emits no code at all unless one of
//! its methods is actually called: the orderings derive from the spaceship,
//! and the array helpers ride on the index and size primitives.

use once_cell::sync::Lazy;

use crate::ast::Node;
use crate::error::Source;
use crate::parser::Parser;

pub const SOURCE: &str = "\
class Integer
  def <(other)
    (self <=> other) == -1
  end

  def >(other)
    (self <=> other) == 1
  end

  def <=(other)
    !(self > other)
  end

  def >=(other)
    !(self < other)
  end
end

class Array
  def first
    self[0]
  end

  def last
    self[size - 1]
  end

  def empty?
    size == 0
  end
end
";

static AST: Lazy<Vec<Node>> = Lazy::new(|| {
    Parser::parse(SOURCE, Source::Prelude).expect("the prelude always parses")
});

/// The parsed prelude, shared across compilations.
pub fn ast() -> &'static [Node] {
    &AST
}
