use std::fmt::Write;

use crate::ast::{Node, Target};
use crate::ir::Instruction;

/// Pretty-prints a parsed program with indentation, one node per line.
/// Behind the CLI's `--print-ast` flag.
pub fn pretty_print_ast(program: &[Node]) -> String {
    let mut out = String::new();
    for node in program {
        print_node(&mut out, node, 0);
    }
    out
}

fn line(out: &mut String, indent: usize, text: &str) {
    writeln!(out, "{}{}", "  ".repeat(indent), text).unwrap();
}

fn print_body(out: &mut String, label: &str, body: &[Node], indent: usize) {
    if body.is_empty() {
        return;
    }
    line(out, indent, label);
    for node in body {
        print_node(out, node, indent + 1);
    }
}

fn print_node(out: &mut String, node: &Node, indent: usize) {
    match node {
        Node::Int { value, .. } => line(out, indent, &format!("Int:{}", value)),
        Node::Str { value, .. } => line(out, indent, &format!("Str:{:?}", value)),
        Node::True { .. } => line(out, indent, "Bool:true"),
        Node::False { .. } => line(out, indent, "Bool:false"),
        Node::Nil { .. } => line(out, indent, "Nil"),
        Node::SelfRef { .. } => line(out, indent, "Self"),
        Node::Ident { name, .. } => line(out, indent, &format!("Ident:{}", name)),
        Node::Const { name, .. } => line(out, indent, &format!("Const:{}", name)),
        Node::Assign { target, value, .. } => {
            match target.as_ref() {
                Target::Local { name, .. } => {
                    line(out, indent, &format!("Assign:{}", name))
                }
                Target::Const { name, .. } => {
                    line(out, indent, &format!("Assign:{}", name))
                }
                Target::Index { recv, index, .. } => {
                    line(out, indent, "AssignIndex");
                    print_node(out, recv, indent + 1);
                    print_node(out, index, indent + 1);
                }
            }
            print_node(out, value, indent + 1);
        }
        Node::ArrayLit { elements, .. } => {
            line(out, indent, "Array");
            for element in elements {
                print_node(out, element, indent + 1);
            }
        }
        Node::HashLit { pairs, .. } => {
            line(out, indent, "Hash");
            for (key, value) in pairs {
                print_node(out, key, indent + 1);
                print_node(out, value, indent + 2);
            }
        }
        Node::Binary { op, lhs, rhs, .. } => {
            line(out, indent, &format!("Binary:{}", op.symbol()));
            print_node(out, lhs, indent + 1);
            print_node(out, rhs, indent + 1);
        }
        Node::Not { expr, .. } => {
            line(out, indent, "Not");
            print_node(out, expr, indent + 1);
        }
        Node::Neg { expr, .. } => {
            line(out, indent, "Neg");
            print_node(out, expr, indent + 1);
        }
        Node::If { cond, then_body, else_body, .. } => {
            line(out, indent, "If");
            print_node(out, cond, indent + 1);
            print_body(out, "then:", then_body, indent + 1);
            print_body(out, "else:", else_body, indent + 1);
        }
        Node::While { cond, body, .. } => {
            line(out, indent, "While");
            print_node(out, cond, indent + 1);
            print_body(out, "do:", body, indent + 1);
        }
        Node::Case { subject, whens, else_body, .. } => {
            line(out, indent, "Case");
            print_node(out, subject, indent + 1);
            for arm in whens {
                line(out, indent + 1, "when:");
                for pattern in &arm.patterns {
                    print_node(out, pattern, indent + 2);
                }
                print_body(out, "then:", &arm.body, indent + 1);
            }
            print_body(out, "else:", else_body, indent + 1);
        }
        Node::Def { name, params, body, .. } => {
            line(out, indent, &format!("Def:{}({})", name, params.join(", ")));
            for node in body {
                print_node(out, node, indent + 1);
            }
        }
        Node::Class { name, body, .. } => {
            line(out, indent, &format!("Class:{}", name));
            for node in body {
                print_node(out, node, indent + 1);
            }
        }
        Node::Call { recv, name, args, .. } => {
            line(out, indent, &format!("Call:{}", name));
            if let Some(recv) = recv {
                line(out, indent + 1, "recv:");
                print_node(out, recv, indent + 2);
            }
            for arg in args {
                print_node(out, arg, indent + 1);
            }
        }
        Node::Return { value, .. } => {
            line(out, indent, "Return");
            if let Some(value) = value {
                print_node(out, value, indent + 1);
            }
        }
        Node::Raise { message, .. } => {
            line(out, indent, &format!("Raise:{:?}", message))
        }
    }
}

/// Renders an instruction stream as a numbered listing. Behind the CLI's
/// `--print-ir` flag.
pub fn pretty_print_ir(program: &[Instruction]) -> String {
    let mut out = String::new();
    for (at, inst) in program.iter().enumerate() {
        match inst {
            Instruction::Mark(_) => writeln!(out, "{:5} {}", at, inst).unwrap(),
            _ => writeln!(out, "{:5}   {}", at, inst).unwrap(),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Source;
    use crate::parser::Parser;

    #[test]
    fn ast_printer_indents_nested_nodes() {
        let program = Parser::parse("if x == 0 then put_as_number 1 end", Source::Inline)
            .unwrap();
        let printed = pretty_print_ast(&program);
        assert!(printed.contains("If"));
        assert!(printed.contains("  Binary:=="));
        assert!(printed.contains("    Ident:x"));
    }

    #[test]
    fn ir_printer_numbers_instructions() {
        use num_bigint::BigInt;
        let listing = pretty_print_ir(&[
            Instruction::Push(BigInt::from(5)),
            Instruction::Mark(BigInt::from(1)),
            Instruction::Exit,
        ]);
        assert!(listing.contains("0   push 5"));
        assert!(listing.contains("1 L1:"));
        assert!(listing.contains("2   exit"));
    }
}
