//! Structured signatures.
//!
//! A signature is the canonical name of a module, class, method or type
//! parameter. Signatures are parsed into a structural value and compared
//! structurally; rendering them back produces the canonical string form.
//!
//! ```text
//! sign       = empty | "[" id "]" | module ("." class_or_method)*
//! module     = (id ("::" id)*)?
//! class      = id typeparams?
//! method     = id typeparams? "(" params? ")"
//! typeparams = "[" id ("," id)* "]"
//! params     = param ("," param)*
//! param      = "[" id "]" | module ("." class)+ ("(" params? ")")?
//! ```

use std::fmt::{self, Display, Formatter};

use crate::errors::FatalError;
use crate::utilities::join;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SignKind {
	Empty,
	Module,
	Class,
	Method,
	TypeParam,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SignElement {
	name: String,
	kind: SignKind,
	type_params: Vec<String>,
	params: Vec<SignParam>,
}

impl SignElement {
	pub fn new(name: impl Into<String>, kind: SignKind) -> Self {
		Self { name: name.into(), kind, type_params: vec![], params: vec![] }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> SignKind {
		self.kind
	}

	pub fn type_params(&self) -> &[String] {
		&self.type_params
	}

	pub fn params(&self) -> &[SignParam] {
		&self.params
	}
}

impl Display for SignElement {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.kind {
			SignKind::Empty | SignKind::Module => write!(f, "{}", self.name),
			SignKind::Class => {
				write!(f, "{}", self.name)?;
				if !self.type_params.is_empty() {
					write!(f, "[{}]", self.type_params.join(", "))?;
				}
				Ok(())
			}
			SignKind::Method => {
				write!(f, "{}", self.name)?;
				if !self.type_params.is_empty() {
					write!(f, "[{}]", self.type_params.join(", "))?;
				}
				write!(f, "({})", join(&self.params, ", "))
			}
			SignKind::TypeParam => write!(f, "[{}]", self.name),
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ParamKind {
	Class,
	TypeParam,
	Callback,
}

/// A single parameter inside a method signature. Parameters are themselves
/// signatures, or nested callbacks carrying their own parameter list.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SignParam {
	kind: ParamKind,
	name: Sign,
	params: Vec<SignParam>,
}

impl SignParam {
	pub fn kind(&self) -> ParamKind {
		self.kind
	}

	pub fn name(&self) -> &Sign {
		&self.name
	}

	pub fn params(&self) -> &[SignParam] {
		&self.params
	}
}

impl Display for SignParam {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.kind {
			ParamKind::Class | ParamKind::TypeParam => write!(f, "{}", self.name),
			ParamKind::Callback => write!(f, "{}({})", self.name, join(&self.params, ", ")),
		}
	}
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Sign {
	elements: Vec<SignElement>,
}

impl Sign {
	pub const EMPTY: Sign = Sign { elements: Vec::new() };

	pub fn parse(text: &str) -> Result<Self, FatalError> {
		Parser::new(text).parse()
	}

	pub fn from_elements(elements: Vec<SignElement>) -> Self {
		Self { elements }
	}

	pub fn elements(&self) -> &[SignElement] {
		&self.elements
	}

	pub fn is_empty(&self) -> bool {
		self.elements.is_empty()
	}

	pub fn kind(&self) -> SignKind {
		self.elements.last().map(SignElement::kind).unwrap_or(SignKind::Empty)
	}

	/// The rendering of the last element. For methods this includes the
	/// parameter list; member tables are keyed by exactly this form.
	pub fn name(&self) -> String {
		self.elements.last().map(|e| e.to_string()).unwrap_or_default()
	}

	pub fn type_params(&self) -> &[String] {
		self.elements.last().map(|e| e.type_params()).unwrap_or(&[])
	}

	pub fn params(&self) -> &[SignParam] {
		self.elements.last().map(|e| e.params()).unwrap_or(&[])
	}

	pub fn parent(&self) -> Sign {
		let mut elements = self.elements.clone();
		elements.pop();
		Sign { elements }
	}

	pub fn parent_module(&self) -> Sign {
		let elements = self
			.elements
			.iter()
			.take_while(|e| e.kind() == SignKind::Module)
			.cloned()
			.collect();
		Sign { elements }
	}

	/// Appends `tail` and re-parses the composed rendering, so the new
	/// element picks up its structural kind.
	pub fn join(&self, tail: &str) -> Result<Sign, FatalError> {
		if self.is_empty() {
			Sign::parse(tail)
		} else {
			Sign::parse(&format!("{self}.{tail}"))
		}
	}
}

impl Display for Sign {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		for (i, element) in self.elements.iter().enumerate() {
			if i > 0 {
				match element.kind() {
					SignKind::Module => write!(f, "::")?,
					SignKind::Class | SignKind::Method => write!(f, ".")?,
					SignKind::Empty | SignKind::TypeParam => {}
				}
			}
			write!(f, "{element}")?;
		}
		Ok(())
	}
}

struct Parser<'l> {
	text: &'l str,
	bytes: &'l [u8],
	pos: usize,
}

impl<'l> Parser<'l> {
	fn new(text: &'l str) -> Self {
		Self { text, bytes: text.as_bytes(), pos: 0 }
	}

	fn malformed(&self) -> FatalError {
		FatalError::IllegalAccess(format!("malformed signature: '{}'", self.text))
	}

	fn skip_ws(&mut self) {
		while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
			self.pos += 1;
		}
	}

	fn peek(&self) -> Option<u8> {
		self.bytes.get(self.pos).copied()
	}

	fn eat(&mut self, byte: u8) -> bool {
		if self.peek() == Some(byte) {
			self.pos += 1;
			true
		} else {
			false
		}
	}

	fn expect(&mut self, byte: u8) -> Result<(), FatalError> {
		match self.eat(byte) {
			true => Ok(()),
			false => Err(self.malformed()),
		}
	}

	fn at_double_colon(&self) -> bool {
		self.bytes[self.pos..].starts_with(b"::")
	}

	fn identifier(&mut self) -> Result<&'l str, FatalError> {
		self.skip_ws();
		let start = self.pos;
		while let Some(b) = self.peek() {
			if matches!(b, b'.' | b':' | b',' | b'[' | b']' | b'(' | b')') || b.is_ascii_whitespace() {
				break;
			}
			self.pos += 1;
		}
		match self.pos > start {
			true => Ok(&self.text[start..self.pos]),
			false => Err(self.malformed()),
		}
	}

	fn parse(mut self) -> Result<Sign, FatalError> {
		self.skip_ws();
		if self.peek().is_none() {
			return Ok(Sign::EMPTY);
		}
		if self.peek() == Some(b'[') {
			// A bare type parameter: "[T]".
			self.pos += 1;
			let name = self.identifier()?;
			self.expect(b']')?;
			self.skip_ws();
			if self.peek().is_some() {
				return Err(self.malformed());
			}
			return Ok(Sign::from_elements(vec![SignElement::new(name, SignKind::TypeParam)]));
		}

		let mut elements = self.module_chain()?;
		while self.eat(b'.') {
			let name = self.identifier()?;
			elements.push(self.class_or_method(name)?);
		}
		self.skip_ws();
		if self.peek().is_some() {
			return Err(self.malformed());
		}
		Ok(Sign::from_elements(elements))
	}

	/// Parses the leading `id ("::" id)*` chain. The final identifier of
	/// the chain becomes a class or method element instead when type
	/// parameters or a parameter list follow it directly.
	fn module_chain(&mut self) -> Result<Vec<SignElement>, FatalError> {
		let mut elements = vec![];
		loop {
			let name = self.identifier()?;
			if self.at_double_colon() {
				self.pos += 2;
				elements.push(SignElement::new(name, SignKind::Module));
				continue;
			}
			if matches!(self.peek(), Some(b'[') | Some(b'(')) {
				elements.push(self.class_or_method(name)?);
			} else {
				elements.push(SignElement::new(name, SignKind::Module));
			}
			return Ok(elements);
		}
	}

	fn class_or_method(&mut self, name: &str) -> Result<SignElement, FatalError> {
		let type_params = match self.peek() {
			Some(b'[') => self.type_params()?,
			_ => vec![],
		};
		if self.eat(b'(') {
			let params = self.params()?;
			self.expect(b')')?;
			return Ok(SignElement {
				name: name.into(),
				kind: SignKind::Method,
				type_params,
				params,
			});
		}
		Ok(SignElement {
			name: name.into(),
			kind: SignKind::Class,
			type_params,
			params: vec![],
		})
	}

	fn type_params(&mut self) -> Result<Vec<String>, FatalError> {
		self.expect(b'[')?;
		let mut names = vec![self.identifier()?.to_string()];
		while self.eat(b',') {
			names.push(self.identifier()?.to_string());
		}
		self.expect(b']')?;
		Ok(names)
	}

	fn params(&mut self) -> Result<Vec<SignParam>, FatalError> {
		self.skip_ws();
		if self.peek() == Some(b')') {
			return Ok(vec![]);
		}
		let mut params = vec![self.param()?];
		while self.eat(b',') {
			params.push(self.param()?);
		}
		Ok(params)
	}

	fn param(&mut self) -> Result<SignParam, FatalError> {
		self.skip_ws();
		if self.eat(b'[') {
			let name = self.identifier()?;
			self.expect(b']')?;
			let sign = Sign::from_elements(vec![SignElement::new(name, SignKind::TypeParam)]);
			return Ok(SignParam { kind: ParamKind::TypeParam, name: sign, params: vec![] });
		}

		let mut elements = self.module_chain()?;
		while self.eat(b'.') {
			let name = self.identifier()?;
			let type_params = match self.peek() {
				Some(b'[') => self.type_params()?,
				_ => vec![],
			};
			elements.push(SignElement {
				name: name.into(),
				kind: SignKind::Class,
				type_params,
				params: vec![],
			});
		}
		let name = Sign::from_elements(elements);
		if self.eat(b'(') {
			let params = self.params()?;
			self.expect(b')')?;
			return Ok(SignParam { kind: ParamKind::Callback, name, params });
		}
		Ok(SignParam { kind: ParamKind::Class, name, params: vec![] })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_sign() {
		let sign = Sign::parse("").unwrap();
		assert!(sign.is_empty());
		assert_eq!(sign.kind(), SignKind::Empty);
		assert_eq!(sign.to_string(), "");
	}

	#[test]
	fn bare_module() {
		let sign = Sign::parse("basic").unwrap();
		assert_eq!(sign.kind(), SignKind::Module);
		assert_eq!(sign.name(), "basic");
	}

	#[test]
	fn nested_modules_render_with_double_colons() {
		let sign = Sign::parse("app::net::http").unwrap();
		assert_eq!(sign.elements().len(), 3);
		assert!(sign.elements().iter().all(|e| e.kind() == SignKind::Module));
		assert_eq!(sign.to_string(), "app::net::http");
	}

	#[test]
	fn class_with_type_params() {
		let sign = Sign::parse("basic.array[T]").unwrap();
		assert_eq!(sign.kind(), SignKind::Class);
		assert_eq!(sign.name(), "array[T]");
		assert_eq!(sign.type_params(), ["T".to_string()]);
		assert_eq!(sign.to_string(), "basic.array[T]");
	}

	#[test]
	fn method_with_params() {
		let sign = Sign::parse("app.Server.handle(basic.int, basic.string)").unwrap();
		assert_eq!(sign.kind(), SignKind::Method);
		assert_eq!(sign.name(), "handle(basic.int, basic.string)");
		assert_eq!(sign.params().len(), 2);
		assert_eq!(sign.to_string(), "app.Server.handle(basic.int, basic.string)");
	}

	#[test]
	fn callback_param() {
		let sign = Sign::parse("app.each(app.Fn(basic.int))").unwrap();
		let params = sign.params();
		assert_eq!(params.len(), 1);
		assert_eq!(params[0].kind(), ParamKind::Callback);
		assert_eq!(sign.to_string(), "app.each(app.Fn(basic.int))");
	}

	#[test]
	fn type_param_sign() {
		let sign = Sign::parse("[T]").unwrap();
		assert_eq!(sign.kind(), SignKind::TypeParam);
		assert_eq!(sign.to_string(), "[T]");
	}

	#[test]
	fn type_param_as_method_param() {
		let sign = Sign::parse("app.push([T])").unwrap();
		assert_eq!(sign.params()[0].kind(), ParamKind::TypeParam);
		assert_eq!(sign.to_string(), "app.push([T])");
	}

	#[test]
	fn join_composes_and_reparses() {
		let module = Sign::parse("app::core").unwrap();
		let method = module.join("main()").unwrap();
		assert_eq!(method.kind(), SignKind::Method);
		assert_eq!(method.name(), "main()");
		assert_eq!(method.parent_module().to_string(), "app::core");
	}

	#[test]
	fn structural_equality_matches_rendering_equality() {
		let a = Sign::parse("app.Server.handle(basic.int)").unwrap();
		let b = Sign::parse("app.Server.handle(basic.int)").unwrap();
		assert_eq!(a, b);
		assert_ne!(a, Sign::parse("app.Server.handle(basic.float)").unwrap());
	}

	#[test]
	fn malformed_signs_are_rejected() {
		assert!(Sign::parse("app.").is_err());
		assert!(Sign::parse("[T").is_err());
		assert!(Sign::parse("a.b(").is_err());
		assert!(Sign::parse("a..b").is_err());
	}
}
