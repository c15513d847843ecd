use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::raw::CodecError;

/// A constant-pool entry. Tags 0 through 7; the float payload keeps its
/// raw bit pattern so that round-tripping is exact.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Constant {
	Null,
	True,
	False,
	Char(u32),
	Int(i64),
	Float(u64),
	Utf8(String),
	Array(Vec<Constant>),
}

impl Constant {
	pub const TAG_NULL: u8 = 0x00;
	pub const TAG_TRUE: u8 = 0x01;
	pub const TAG_FALSE: u8 = 0x02;
	pub const TAG_CHAR: u8 = 0x03;
	pub const TAG_INT: u8 = 0x04;
	pub const TAG_FLOAT: u8 = 0x05;
	pub const TAG_UTF8: u8 = 0x06;
	pub const TAG_ARRAY: u8 = 0x07;

	pub fn from_f64(value: f64) -> Self {
		Self::Float(value.to_bits())
	}

	pub fn tag(&self) -> u8 {
		match self {
			Constant::Null => Self::TAG_NULL,
			Constant::True => Self::TAG_TRUE,
			Constant::False => Self::TAG_FALSE,
			Constant::Char(_) => Self::TAG_CHAR,
			Constant::Int(_) => Self::TAG_INT,
			Constant::Float(_) => Self::TAG_FLOAT,
			Constant::Utf8(_) => Self::TAG_UTF8,
			Constant::Array(_) => Self::TAG_ARRAY,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Constant::Utf8(text) => Some(text),
			_ => None,
		}
	}

	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		match stream.read_u8()? {
			Self::TAG_NULL => Ok(Constant::Null),
			Self::TAG_TRUE => Ok(Constant::True),
			Self::TAG_FALSE => Ok(Constant::False),
			Self::TAG_CHAR => Ok(Constant::Char(stream.read_u32::<BigEndian>()?)),
			Self::TAG_INT => Ok(Constant::Int(stream.read_i64::<BigEndian>()?)),
			Self::TAG_FLOAT => Ok(Constant::Float(stream.read_u64::<BigEndian>()?)),
			Self::TAG_UTF8 => Ok(Constant::Utf8(read_utf8(stream)?)),
			Self::TAG_ARRAY => {
				let len = stream.read_u16::<BigEndian>()?;
				let mut items = Vec::with_capacity(len as usize);
				for _ in 0..len {
					items.push(Constant::read(stream)?);
				}
				Ok(Constant::Array(items))
			}
			tag => Err(CodecError::InvalidTag(tag)),
		}
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u8(self.tag())?;
		match self {
			Constant::Null | Constant::True | Constant::False => {}
			Constant::Char(value) => stream.write_u32::<BigEndian>(*value)?,
			Constant::Int(value) => stream.write_i64::<BigEndian>(*value)?,
			Constant::Float(bits) => stream.write_u64::<BigEndian>(*bits)?,
			Constant::Utf8(text) => write_utf8(stream, text)?,
			Constant::Array(items) => {
				stream.write_u16::<BigEndian>(checked_u16(items.len(), "array constant")?)?;
				for item in items {
					item.write(stream)?;
				}
			}
		}
		Ok(())
	}
}

/// A metadata table: ordered key/value pairs of UTF-8 strings. Order is
/// preserved so that writing reproduces the input bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata(pub Vec<(String, String)>);

impl Metadata {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		let len = stream.read_u16::<BigEndian>()?;
		let mut entries = Vec::with_capacity(len as usize);
		for _ in 0..len {
			let key = read_utf8(stream)?;
			let value = read_utf8(stream)?;
			entries.push((key, value));
		}
		Ok(Self(entries))
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u16::<BigEndian>(checked_u16(self.0.len(), "metadata table")?)?;
		for (key, value) in &self.0 {
			write_utf8(stream, key)?;
			write_utf8(stream, value)?;
		}
		Ok(())
	}
}

pub(crate) fn read_utf8(stream: &mut impl Read) -> Result<String, CodecError> {
	let len = stream.read_u16::<BigEndian>()?;
	let mut bytes = vec![0u8; len as usize];
	stream.read_exact(&mut bytes)?;
	String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

pub(crate) fn write_utf8(stream: &mut impl Write, text: &str) -> Result<(), CodecError> {
	stream.write_u16::<BigEndian>(checked_u16(text.len(), "utf-8 string")?)?;
	stream.write_all(text.as_bytes())?;
	Ok(())
}

pub(crate) fn checked_u16(len: usize, what: &'static str) -> Result<u16, CodecError> {
	u16::try_from(len).map_err(|_| CodecError::CountOverflow(what))
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;

	fn round_trip(constant: &Constant) -> Constant {
		let mut bytes = vec![];
		constant.write(&mut bytes).unwrap();
		Constant::read(&mut Cursor::new(bytes)).unwrap()
	}

	#[test]
	fn constants_round_trip() {
		let values = [
			Constant::Null,
			Constant::True,
			Constant::False,
			Constant::Char('λ' as u32),
			Constant::Int(-42),
			Constant::from_f64(0.25),
			Constant::Utf8("hello".into()),
			Constant::Array(vec![Constant::Int(1), Constant::Utf8("two".into())]),
		];
		for value in &values {
			assert_eq!(&round_trip(value), value);
		}
	}

	#[test]
	fn unknown_tag_is_rejected() {
		let result = Constant::read(&mut Cursor::new([0x08u8]));
		assert!(matches!(result, Err(CodecError::InvalidTag(0x08))));
	}

	#[test]
	fn truncated_string_is_rejected() {
		// Length claims four bytes, only two follow.
		let result = Constant::read(&mut Cursor::new([0x06, 0x00, 0x04, b'h', b'i']));
		assert!(matches!(result, Err(CodecError::Io(_))));
	}
}
