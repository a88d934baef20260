//! Loaded modules and their token tables.
//!
//! A module maps its local token space onto the VM-global registries: token
//! kind selects a table, the token index a row. Each module also owns a
//! static reference block — the GC-visible storage for its static fields.

use std::sync::{Arc, RwLock};

use ovum_core::{FieldId, MethodId, StrId, Token, TokenKind, TypeId, Value};

/// One static field cell. Reads and writes are individually synchronized;
/// the root-set walker reads every cell during a GC cycle.
#[derive(Debug, Default)]
pub struct StaticRef {
    value: RwLock<Value>,
}

impl StaticRef {
    pub fn read(&self) -> Value {
        self.value.read().unwrap().clone()
    }

    pub fn write(&self, value: Value) {
        *self.value.write().unwrap() = value;
    }
}

/// The static reference block of one module, traversed by the root-set
/// walker.
#[derive(Debug, Default)]
pub struct StaticRefBlock {
    pub values: Vec<StaticRef>,
}

impl StaticRefBlock {
    pub fn new(count: usize) -> StaticRefBlock {
        let mut values = Vec::with_capacity(count);
        values.resize_with(count, StaticRef::default);
        StaticRefBlock { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A loaded module.
#[derive(Debug)]
pub struct Module {
    pub name: Arc<str>,
    /// Token tables: row `i` of each table backs token `kind << 24 | i`.
    pub types: Vec<TypeId>,
    pub methods: Vec<MethodId>,
    pub fields: Vec<FieldId>,
    pub strings: Vec<StrId>,
    pub statics: StaticRefBlock,
    /// The module's main method, when it has one.
    pub main: Option<MethodId>,
}

impl Module {
    pub fn resolve_type(&self, token: Token) -> Option<TypeId> {
        match token.kind()? {
            TokenKind::Type => self.types.get(token.index()).copied(),
            _ => None,
        }
    }

    pub fn resolve_method(&self, token: Token) -> Option<MethodId> {
        match token.kind()? {
            TokenKind::Method => self.methods.get(token.index()).copied(),
            _ => None,
        }
    }

    pub fn resolve_field(&self, token: Token) -> Option<FieldId> {
        match token.kind()? {
            TokenKind::Field => self.fields.get(token.index()).copied(),
            _ => None,
        }
    }

    pub fn resolve_string(&self, token: Token) -> Option<StrId> {
        match token.kind()? {
            TokenKind::String => self.strings.get(token.index()).copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_resolution_checks_kind() {
        let module = Module {
            name: Arc::from("test"),
            types: vec![TypeId(7)],
            methods: vec![MethodId(3)],
            fields: Vec::new(),
            strings: Vec::new(),
            statics: StaticRefBlock::default(),
            main: None,
        };
        assert_eq!(
            module.resolve_type(Token::new(TokenKind::Type, 0)),
            Some(TypeId(7))
        );
        assert_eq!(module.resolve_type(Token::new(TokenKind::Method, 0)), None);
        assert_eq!(module.resolve_method(Token::new(TokenKind::Method, 1)), None);
    }

    #[test]
    fn static_ref_round_trip() {
        let block = StaticRefBlock::new(2);
        assert_eq!(block.len(), 2);
        block.values[1].write(Value::Int(9));
        assert_eq!(block.values[1].read(), Value::Int(9));
        assert_eq!(block.values[0].read(), Value::Null);
    }
}
