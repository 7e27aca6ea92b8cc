// src/compiler.rs
//
// Interface to the script compiler used by `load()`.
//
// The compiler turns source text into a bank description; the instance
// turns that description into objects in the handle table.

use std::sync::Arc;

use crate::program::Program;
use crate::wave::Wave;

/// One compiled definition.
pub enum Definition {
    Program(Arc<dyn Program>),
    String(String),
    Wave(Wave),
    Bank(BankDef),
}

/// A compiled bank.
#[derive(Default)]
pub struct BankDef {
    /// Definitions exported under their names, in source order.
    pub exports: Vec<(String, Definition)>,
    /// Definitions owned by the bank but only exported with `EXPORT_ALL`.
    pub locals: Vec<(String, Definition)>,
}

impl BankDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: &str, def: Definition) -> Self {
        self.exports.push((name.to_string(), def));
        self
    }

    pub fn local(mut self, name: &str, def: Definition) -> Self {
        self.locals.push((name.to_string(), def));
        self
    }

    /// Number of definitions, counting nested banks' contents.
    pub fn len(&self) -> usize {
        self.exports
            .iter()
            .chain(&self.locals)
            .map(|(_, def)| match def {
                Definition::Bank(bank) => 1 + bank.len(),
                _ => 1,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty() && self.locals.is_empty()
    }
}

/// Compiles script source into a bank.
pub trait ScriptCompiler: Send + Sync {
    /// Compile `source`. `origin` names the source (file path or given name)
    /// for diagnostics. Errors are human readable messages.
    fn compile(&self, source: &str, origin: &str) -> Result<BankDef, String>;
}
