// Strand Compiled Module
// Immutable unit of code loaded into the VM

use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::chunk::Chunk;
use crate::vm::interner::intern;
use crate::vm::value::Value;

/// Constant values stored in the constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Nil,
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
}

impl Const {
    pub fn to_value(&self) -> Value {
        match self {
            Const::Nil => Value::nil(),
            Const::Bool(b) => Value::bool(*b),
            Const::Num(n) => Value::num(*n),
            Const::Str(s) => Value::str(s),
        }
    }
}

/// Which code buffer of a module a frame runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Segment {
    #[default]
    Main,
    Init,
}

/// Script function entry point
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSymbol {
    pub name: Arc<str>,
    pub ip: usize,
    pub args_num: u8,
    pub returns: u8,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: Arc<str>,
    pub file: Arc<str>,
    pub code: Chunk,
    pub init_code: Chunk,
    pub constants: Vec<Const>,
    pub type_refs: Vec<Arc<str>>,
    pub gvars_num: usize,
    /// Sorted by entry ip
    funcs: Vec<FuncSymbol>,
    func_index: FxHashMap<Arc<str>, usize>,
}

impl Module {
    pub fn chunk(&self, segment: Segment) -> &Chunk {
        match segment {
            Segment::Main => &self.code,
            Segment::Init => &self.init_code,
        }
    }

    pub fn func(&self, name: &str) -> Option<&FuncSymbol> {
        self.func_index.get(name).map(|idx| &self.funcs[*idx])
    }

    pub fn func_at(&self, idx: usize) -> Option<&FuncSymbol> {
        self.funcs.get(idx)
    }

    pub fn funcs(&self) -> &[FuncSymbol] {
        &self.funcs
    }

    /// Function whose body contains `ip`
    pub fn map_ip_to_func(&self, ip: i32) -> Option<&FuncSymbol> {
        let ip = usize::try_from(ip).ok()?;
        let pos = self.funcs.partition_point(|f| f.ip <= ip);
        pos.checked_sub(1).map(|i| &self.funcs[i])
    }
}

/// Assembles a module by hand, the way a compiler back end would
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            module: Module {
                name: intern(name),
                file: intern(&format!("{}.bhl", name)),
                code: Chunk::new(),
                init_code: Chunk::new(),
                constants: Vec::new(),
                type_refs: Vec::new(),
                gvars_num: 0,
                funcs: Vec::new(),
                func_index: FxHashMap::default(),
            },
        }
    }

    pub fn file(mut self, file: &str) -> Self {
        self.module.file = intern(file);
        self
    }

    pub fn code(&mut self) -> &mut Chunk {
        &mut self.module.code
    }

    pub fn init_code(&mut self) -> &mut Chunk {
        &mut self.module.init_code
    }

    pub fn constant(&mut self, constant: Const) -> u16 {
        if let Some(idx) = self.module.constants.iter().position(|c| *c == constant) {
            return idx as u16;
        }
        self.module.constants.push(constant);
        (self.module.constants.len() - 1) as u16
    }

    pub fn type_ref(&mut self, name: &str) -> u32 {
        self.module.type_refs.push(intern(name));
        (self.module.type_refs.len() - 1) as u32
    }

    pub fn gvars(&mut self, num: usize) -> &mut Self {
        self.module.gvars_num = num;
        self
    }

    /// Declare a function starting at the current end of the main code,
    /// returns its index
    pub fn func(&mut self, name: &str, args_num: u8, returns: u8) -> u32 {
        let symbol = FuncSymbol {
            name: intern(name),
            ip: self.module.code.current_offset(),
            args_num,
            returns,
        };
        self.module.func_index.insert(symbol.name.clone(), self.module.funcs.len());
        self.module.funcs.push(symbol);
        (self.module.funcs.len() - 1) as u32
    }

    pub fn func_ip(&self, idx: u32) -> usize {
        self.module.funcs[idx as usize].ip
    }

    pub fn build(self) -> Module {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::Opcode;

    #[test]
    fn test_func_lookup_by_ip() {
        let mut b = ModuleBuilder::new("a");
        b.func("main", 0, 0);
        b.code().write_op(Opcode::Return, 1);
        b.code().write_op(Opcode::Return, 1);
        b.func("foo", 1, 1);
        b.code().write_op(Opcode::Return, 2);
        let m = b.build();

        assert_eq!(&*m.file, "a.bhl");
        assert_eq!(m.func("foo").unwrap().ip, 2);
        assert_eq!(&*m.map_ip_to_func(1).unwrap().name, "main");
        assert_eq!(&*m.map_ip_to_func(2).unwrap().name, "foo");
        assert!(m.map_ip_to_func(-1).is_none());
    }

    #[test]
    fn test_constants_dedup() {
        let mut b = ModuleBuilder::new("a");
        let one = b.constant(Const::Num(1.0));
        let s = b.constant(Const::Str("x".into()));
        assert_eq!(b.constant(Const::Num(1.0)), one);
        assert_ne!(one, s);
        assert_eq!(b.build().constants[s as usize].to_value().as_str().unwrap(), "x");
    }
}
