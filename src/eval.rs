// Constant expression evaluator
//
// Evaluates parsed expressions against a lookup scope. Used at parse
// time for #define constants, enum member values and fixed array
// lengths, and at read time for expression-sized arrays that reference
// sibling fields. All arithmetic is performed in i128.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::parser::ast::{BinOp, Expr, ExprKind, UnaryOp};
use crate::registry::{ConstValue, TypeRegistry};
use crate::value::Value;

/// Identifier lookup scope for expression evaluation.
///
/// Lookup order: sibling fields read so far, then local bindings (enum
/// members currently being parsed), then registry constants, then
/// enum/flag members.
pub(crate) struct Scope<'a> {
    pub reg: &'a TypeRegistry,
    pub fields: Option<&'a [(Arc<str>, Value)]>,
    pub locals: Option<&'a FxHashMap<String, i128>>,
}

impl<'a> Scope<'a> {
    pub fn new(reg: &'a TypeRegistry) -> Self {
        Self {
            reg,
            fields: None,
            locals: None,
        }
    }

    pub fn with_fields(reg: &'a TypeRegistry, fields: &'a [(Arc<str>, Value)]) -> Self {
        Self {
            reg,
            fields: Some(fields),
            locals: None,
        }
    }

    pub fn with_locals(reg: &'a TypeRegistry, locals: &'a FxHashMap<String, i128>) -> Self {
        Self {
            reg,
            fields: None,
            locals: Some(locals),
        }
    }

    fn lookup(&self, name: &str) -> Result<i128, Error> {
        if let Some(fields) = self.fields {
            if let Some((_, value)) = fields.iter().rev().find(|(n, _)| n.as_ref() == name) {
                return value_as_int(name, value);
            }
        }
        if let Some(locals) = self.locals {
            if let Some(v) = locals.get(name) {
                return Ok(*v);
            }
        }
        match self.reg.const_value(name) {
            Some(ConstValue::Int(v)) => return Ok(*v),
            Some(ConstValue::Str(_)) => {
                return Err(Error::BadExpression(format!(
                    "constant `{}` is a string, not an integer",
                    name
                )))
            }
            None => {}
        }
        if let Some(v) = self.reg.enum_member(name) {
            return Ok(v);
        }
        Err(Error::BadExpression(format!(
            "unknown identifier `{}`",
            name
        )))
    }
}

fn value_as_int(name: &str, value: &Value) -> Result<i128, Error> {
    match value {
        Value::Int(v) => Ok(*v),
        Value::Char(b) => Ok(*b as i128),
        Value::WChar(c) => Ok(*c as u32 as i128),
        Value::Enum(e) => Ok(e.value),
        Value::Pointer(p) => Ok(p.addr as i128),
        other => Err(Error::BadExpression(format!(
            "field `{}` is not an integer: {}",
            name, other
        ))),
    }
}

/// Evaluate an expression to an integer
pub(crate) fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<i128, Error> {
    match &expr.kind {
        ExprKind::IntLiteral(v) => {
            if *v > i128::MAX as u128 {
                return Err(Error::BadExpression(format!(
                    "integer literal {} overflows",
                    v
                )));
            }
            Ok(*v as i128)
        }
        ExprKind::CharLiteral(b) => Ok(*b as i128),
        ExprKind::Ident(name) => scope.lookup(name),
        ExprKind::ScopedIdent(type_name, member) => scope
            .reg
            .scoped_enum_member(type_name, member)
            .ok_or_else(|| {
                Error::BadExpression(format!("unknown enum member `{}::{}`", type_name, member))
            }),
        ExprKind::Unary { op, expr } => {
            let v = eval(expr, scope)?;
            Ok(match op {
                UnaryOp::Neg => v
                    .checked_neg()
                    .ok_or_else(|| Error::BadExpression("negation overflow".to_string()))?,
                UnaryOp::BitNot => !v,
                UnaryOp::Not => (v == 0) as i128,
            })
        }
        ExprKind::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope),
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            if eval(cond, scope)? != 0 {
                eval(then_expr, scope)
            } else {
                eval(else_expr, scope)
            }
        }
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &Scope<'_>) -> Result<i128, Error> {
    // Logical operators short-circuit
    match op {
        BinOp::LogAnd => {
            return Ok((eval(lhs, scope)? != 0 && eval(rhs, scope)? != 0) as i128);
        }
        BinOp::LogOr => {
            return Ok((eval(lhs, scope)? != 0 || eval(rhs, scope)? != 0) as i128);
        }
        _ => {}
    }

    let a = eval(lhs, scope)?;
    let b = eval(rhs, scope)?;
    let overflow = || Error::BadExpression("arithmetic overflow".to_string());
    match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                Err(Error::BadExpression("division by zero".to_string()))
            } else {
                a.checked_div(b).ok_or_else(overflow)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                Err(Error::BadExpression("modulo by zero".to_string()))
            } else {
                a.checked_rem(b).ok_or_else(overflow)
            }
        }
        BinOp::Shl | BinOp::Shr => {
            if !(0..128).contains(&b) {
                return Err(Error::BadExpression(format!(
                    "shift by {} is out of range",
                    b
                )));
            }
            Ok(match op {
                BinOp::Shl => a.checked_shl(b as u32).ok_or_else(overflow)?,
                _ => a >> b as u32,
            })
        }
        BinOp::BitAnd => Ok(a & b),
        BinOp::BitOr => Ok(a | b),
        BinOp::BitXor => Ok(a ^ b),
        BinOp::Eq => Ok((a == b) as i128),
        BinOp::Ne => Ok((a != b) as i128),
        BinOp::Lt => Ok((a < b) as i128),
        BinOp::Gt => Ok((a > b) as i128),
        BinOp::Le => Ok((a <= b) as i128),
        BinOp::Ge => Ok((a >= b) as i128),
        BinOp::LogAnd | BinOp::LogOr => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;

    fn eval_str(reg: &TypeRegistry, text: &str) -> Result<i128, Error> {
        reg.resolve_expr(text)
    }

    #[test]
    fn test_precedence() {
        let reg = TypeRegistry::new();
        assert_eq!(eval_str(&reg, "2 + 3 * 4").unwrap(), 14);
        assert_eq!(eval_str(&reg, "(2 + 3) * 4").unwrap(), 20);
        assert_eq!(eval_str(&reg, "1 << 4 | 1").unwrap(), 17);
        assert_eq!(eval_str(&reg, "0xFF & 0x0F").unwrap(), 0x0F);
        assert_eq!(eval_str(&reg, "10 % 3").unwrap(), 1);
        assert_eq!(eval_str(&reg, "7 / 2").unwrap(), 3);
    }

    #[test]
    fn test_unary() {
        let reg = TypeRegistry::new();
        assert_eq!(eval_str(&reg, "-5 + 10").unwrap(), 5);
        assert_eq!(eval_str(&reg, "~0 & 0xFF").unwrap(), 0xFF);
        assert_eq!(eval_str(&reg, "!0").unwrap(), 1);
        assert_eq!(eval_str(&reg, "!42").unwrap(), 0);
        assert_eq!(eval_str(&reg, "+7").unwrap(), 7);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let reg = TypeRegistry::new();
        assert_eq!(eval_str(&reg, "1 < 2").unwrap(), 1);
        assert_eq!(eval_str(&reg, "2 <= 1").unwrap(), 0);
        assert_eq!(eval_str(&reg, "3 == 3 && 1 != 2").unwrap(), 1);
        assert_eq!(eval_str(&reg, "0 || 5 > 4").unwrap(), 1);
    }

    #[test]
    fn test_ternary() {
        let reg = TypeRegistry::new();
        assert_eq!(eval_str(&reg, "1 ? 10 : 20").unwrap(), 10);
        assert_eq!(eval_str(&reg, "0 ? 10 : 20").unwrap(), 20);
        assert_eq!(eval_str(&reg, "2 > 1 ? 2 > 3 ? 1 : 2 : 3").unwrap(), 2);
    }

    #[test]
    fn test_char_literal() {
        let reg = TypeRegistry::new();
        assert_eq!(eval_str(&reg, "'A'").unwrap(), 0x41);
        assert_eq!(eval_str(&reg, "'\\n'").unwrap(), 10);
    }

    #[test]
    fn test_division_by_zero() {
        let reg = TypeRegistry::new();
        assert!(matches!(
            eval_str(&reg, "1 / 0"),
            Err(Error::BadExpression(_))
        ));
        assert!(matches!(
            eval_str(&reg, "1 % 0"),
            Err(Error::BadExpression(_))
        ));
    }

    #[test]
    fn test_oversized_shift() {
        let reg = TypeRegistry::new();
        assert!(matches!(
            eval_str(&reg, "1 << 128"),
            Err(Error::BadExpression(_))
        ));
        assert!(matches!(
            eval_str(&reg, "1 >> 200"),
            Err(Error::BadExpression(_))
        ));
        assert!(matches!(
            eval_str(&reg, "1 << -1"),
            Err(Error::BadExpression(_))
        ));
    }

    #[test]
    fn test_unknown_identifier() {
        let reg = TypeRegistry::new();
        assert!(matches!(
            eval_str(&reg, "NOPE + 1"),
            Err(Error::BadExpression(_))
        ));
    }

    #[test]
    fn test_constant_lookup() {
        let mut reg = TypeRegistry::new();
        reg.load("#define WIDTH 640\n#define HEIGHT 480\n").unwrap();
        assert_eq!(eval_str(&reg, "WIDTH * HEIGHT").unwrap(), 640 * 480);
    }

    #[test]
    fn test_enum_member_lookup() {
        let mut reg = TypeRegistry::new();
        reg.load("enum Color { RED = 1, GREEN = 2, BLUE = 4 };")
            .unwrap();
        assert_eq!(eval_str(&reg, "GREEN | BLUE").unwrap(), 6);
        assert_eq!(eval_str(&reg, "Color::RED").unwrap(), 1);
    }
}
