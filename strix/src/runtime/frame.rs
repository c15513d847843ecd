use std::sync::Arc;

use crate::errors::FatalError;
use crate::runtime::obj::ObjRef;
use crate::runtime::tables::{ExceptionTable, LineTable, MatchTable, VariableTable};

/// The immutable per-method blueprint: code, table prototypes and the
/// operand-stack bound. Every call clones the variable tables and gets a
/// fresh stack; the code and lookup tables are shared.
#[derive(Clone)]
pub struct FrameTemplate {
	code: Arc<[u8]>,
	stack_max: u32,
	closure_start: u16,
	args: VariableTable,
	locals: VariableTable,
	exceptions: ExceptionTable,
	lines: LineTable,
	matches: Vec<MatchTable>,
}

impl FrameTemplate {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		code: Vec<u8>,
		stack_max: u32,
		closure_start: u16,
		args: VariableTable,
		locals: VariableTable,
		exceptions: ExceptionTable,
		lines: LineTable,
		matches: Vec<MatchTable>,
	) -> Self {
		Self {
			code: code.into(),
			stack_max,
			closure_start,
			args,
			locals,
			exceptions,
			lines,
			matches,
		}
	}

	pub fn code(&self) -> &Arc<[u8]> {
		&self.code
	}

	pub fn stack_max(&self) -> u32 {
		self.stack_max
	}

	/// Index within the locals at which captured variables begin.
	pub fn closure_start(&self) -> u16 {
		self.closure_start
	}

	pub fn args(&self) -> &VariableTable {
		&self.args
	}

	pub fn locals(&self) -> &VariableTable {
		&self.locals
	}

	pub fn locals_mut(&mut self) -> &mut VariableTable {
		&mut self.locals
	}

	pub fn exceptions(&self) -> &ExceptionTable {
		&self.exceptions
	}

	pub fn lines(&self) -> &LineTable {
		&self.lines
	}

	pub fn matches(&self) -> &[MatchTable] {
		&self.matches
	}

	/// Builds an activation record: fresh stack, cloned variable tables
	/// (capture cells shared by identity), shared code and tables.
	pub fn instantiate(&self, method: ObjRef, module: Option<ObjRef>) -> Frame {
		Frame {
			code: self.code.clone(),
			ip: 0,
			stack: Vec::with_capacity(self.stack_max as usize),
			stack_max: self.stack_max as usize,
			args: self.args.clone(),
			locals: self.locals.clone(),
			exceptions: self.exceptions.clone(),
			lines: self.lines.clone(),
			matches: self.matches.clone(),
			method,
			module,
		}
	}
}

/// An activation record: the operand stack, instruction pointer, variable
/// tables and the owning method/module.
pub struct Frame {
	code: Arc<[u8]>,
	ip: usize,
	stack: Vec<ObjRef>,
	stack_max: usize,
	args: VariableTable,
	locals: VariableTable,
	exceptions: ExceptionTable,
	lines: LineTable,
	matches: Vec<MatchTable>,
	method: ObjRef,
	module: Option<ObjRef>,
}

impl Frame {
	pub fn push(&mut self, value: ObjRef) -> Result<(), FatalError> {
		if self.stack.len() >= self.stack_max {
			return Err(FatalError::IllegalAccess("operand stack overflow".into()));
		}
		self.stack.push(value);
		Ok(())
	}

	pub fn pop(&mut self) -> Result<ObjRef, FatalError> {
		self.stack
			.pop()
			.ok_or_else(|| FatalError::IllegalAccess("operand stack underflow".into()))
	}

	pub fn peek(&self) -> Result<ObjRef, FatalError> {
		self.stack
			.last()
			.cloned()
			.ok_or_else(|| FatalError::IllegalAccess("operand stack underflow".into()))
	}

	pub fn stack_len(&self) -> usize {
		self.stack.len()
	}

	pub fn clear_stack(&mut self) {
		self.stack.clear();
	}

	/// Reads the next code byte and advances.
	pub fn read_byte(&mut self) -> Result<u8, FatalError> {
		let byte = self
			.code
			.get(self.ip)
			.copied()
			.ok_or_else(|| FatalError::IllegalAccess("execution ran past the end of code".into()))?;
		self.ip += 1;
		Ok(byte)
	}

	/// The next code byte without advancing, if any.
	pub fn peek_byte(&self) -> Option<u8> {
		self.code.get(self.ip).copied()
	}

	pub fn read_u16(&mut self) -> Result<u16, FatalError> {
		let high = self.read_byte()?;
		let low = self.read_byte()?;
		Ok(u16::from_be_bytes([high, low]))
	}

	pub fn read_i16(&mut self) -> Result<i16, FatalError> {
		Ok(self.read_u16()? as i16)
	}

	pub fn pc(&self) -> u32 {
		self.ip as u32
	}

	pub fn set_pc(&mut self, pc: u32) -> Result<(), FatalError> {
		if pc as usize > self.code.len() {
			return Err(FatalError::IllegalAccess(format!("jump target out of range: {pc}")));
		}
		self.ip = pc as usize;
		Ok(())
	}

	/// Moves the instruction pointer by a relative offset.
	pub fn adjust(&mut self, offset: i32) -> Result<(), FatalError> {
		let target = self.ip as i64 + offset as i64;
		if target < 0 || target > self.code.len() as i64 {
			return Err(FatalError::IllegalAccess(format!("jump target out of range: {target}")));
		}
		self.ip = target as usize;
		Ok(())
	}

	pub fn code_len(&self) -> usize {
		self.code.len()
	}

	/// Loads the constant at `index` from the owning module's pool,
	/// applying the value copy contract.
	pub fn const_at(&self, index: usize) -> Result<ObjRef, FatalError> {
		let module = self
			.module
			.as_ref()
			.ok_or_else(|| FatalError::IllegalAccess("frame has no owning module".into()))?;
		let state = module
			.as_module()
			.ok_or_else(|| FatalError::IllegalAccess("frame module is not a module object".into()))?;
		state
			.constant_pool()
			.get(index)
			.map(|constant| constant.copy())
			.ok_or_else(|| FatalError::IllegalAccess(format!("index out of bounds: {index} (constant pool)")))
	}

	pub fn args(&self) -> &VariableTable {
		&self.args
	}

	pub fn args_mut(&mut self) -> &mut VariableTable {
		&mut self.args
	}

	pub fn locals(&self) -> &VariableTable {
		&self.locals
	}

	pub fn locals_mut(&mut self) -> &mut VariableTable {
		&mut self.locals
	}

	pub fn exceptions(&self) -> &ExceptionTable {
		&self.exceptions
	}

	pub fn lines(&self) -> &LineTable {
		&self.lines
	}

	pub fn matches(&self) -> &[MatchTable] {
		&self.matches
	}

	pub fn method(&self) -> &ObjRef {
		&self.method
	}

	pub fn module(&self) -> Option<&ObjRef> {
		self.module.as_ref()
	}
}
