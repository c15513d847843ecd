use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fxhash::FxHashMap;
use nohash_hasher::IntMap;

use crate::errors::FatalError;
use crate::runtime::memory::MemoryManager;
use crate::runtime::obj::{ObjRef, Ordering};

fn index_error(index: usize, of: &str) -> FatalError {
	FatalError::IllegalAccess(format!("index out of bounds: {index} ({of})"))
}

/// Fixed-length variable cells with per-slot metadata; the backing store
/// of a frame's args and locals.
///
/// A slot holding a `Capture` is read and written *through* the capture,
/// so a slot shared with a closure stays coherent across activations.
pub struct VariableTable {
	cells: Vec<ObjRef>,
	metas: Vec<FxHashMap<String, String>>,
}

impl VariableTable {
	pub fn new(count: usize, null: &ObjRef) -> Self {
		Self {
			cells: vec![null.clone(); count],
			metas: vec![FxHashMap::default(); count],
		}
	}

	pub fn count(&self) -> usize {
		self.cells.len()
	}

	pub fn get(&self, index: usize) -> Result<ObjRef, FatalError> {
		let cell = self.cells.get(index).ok_or_else(|| index_error(index, "variable"))?;
		Ok(match cell.captured() {
			Some(value) => value,
			None => cell.clone(),
		})
	}

	pub fn set(&mut self, index: usize, value: ObjRef) -> Result<(), FatalError> {
		let cell = self.cells.get_mut(index).ok_or_else(|| index_error(index, "variable"))?;
		match cell.captured().is_some() {
			true => cell.set_captured(value)?,
			false => *cell = value,
		}
		Ok(())
	}

	/// Replaces the cell itself, bypassing any installed capture. Closure
	/// creation uses this to plant captures into the copied template.
	pub fn install(&mut self, index: usize, value: ObjRef) -> Result<(), FatalError> {
		let cell = self.cells.get_mut(index).ok_or_else(|| index_error(index, "variable"))?;
		*cell = value;
		Ok(())
	}

	/// Upgrades the slot to a shared capture cell holding its current
	/// value and returns the capture. A slot that is already a capture is
	/// returned as-is, so every party shares one cell.
	pub fn ramp_up(&mut self, index: usize, manager: &Arc<MemoryManager>) -> Result<ObjRef, FatalError> {
		let cell = self.cells.get_mut(index).ok_or_else(|| index_error(index, "variable"))?;
		if cell.captured().is_some() {
			return Ok(cell.clone());
		}
		let capture = manager.capture(cell.clone());
		*cell = capture.clone();
		Ok(capture)
	}

	pub fn meta(&self, index: usize) -> Result<&FxHashMap<String, String>, FatalError> {
		self.metas.get(index).ok_or_else(|| index_error(index, "variable"))
	}

	pub fn set_meta(&mut self, index: usize, meta: FxHashMap<String, String>) -> Result<(), FatalError> {
		let slot = self.metas.get_mut(index).ok_or_else(|| index_error(index, "variable"))?;
		*slot = meta;
		Ok(())
	}
}

impl Clone for VariableTable {
	/// Cloning applies the value copy contract cell by cell: immutable
	/// values and captures keep their identity, so clones of a template
	/// share its capture cells.
	fn clone(&self) -> Self {
		Self {
			cells: self.cells.iter().map(|cell| cell.copy()).collect(),
			metas: self.metas.clone(),
		}
	}
}

/// One protected region of an exception table.
#[derive(Clone)]
pub struct ExceptionEntry {
	from: u32,
	to: u32,
	target: u32,
	ty: ObjRef,
	meta: FxHashMap<String, String>,
}

impl ExceptionEntry {
	pub fn new(from: u32, to: u32, target: u32, ty: ObjRef, meta: FxHashMap<String, String>) -> Self {
		Self { from, to, target, ty, meta }
	}

	pub fn from_pc(&self) -> u32 {
		self.from
	}

	pub fn to_pc(&self) -> u32 {
		self.to
	}

	pub fn target(&self) -> u32 {
		self.target
	}

	pub fn ty(&self) -> &ObjRef {
		&self.ty
	}

	pub fn meta(&self) -> &FxHashMap<String, String> {
		&self.meta
	}
}

/// Ordered list of protected regions; first match wins.
#[derive(Clone, Default)]
pub struct ExceptionTable {
	entries: Vec<ExceptionEntry>,
}

impl ExceptionTable {
	pub fn add(&mut self, entry: ExceptionEntry) {
		self.entries.push(entry);
	}

	pub fn count(&self) -> usize {
		self.entries.len()
	}

	pub fn entries(&self) -> &[ExceptionEntry] {
		&self.entries
	}

	/// The handler target for a throw at `pc`, where `catches` decides
	/// whether an entry's type catches the thrown value's type.
	pub fn target_for(&self, pc: u32, catches: impl Fn(&ObjRef) -> bool) -> Option<u32> {
		self.entries
			.iter()
			.find(|entry| entry.from <= pc && pc < entry.to && catches(&entry.ty))
			.map(|entry| entry.target)
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct LineSpan {
	source_line: u32,
	start: u32,
	end: u32,
}

/// Run-length mapping from code byte offsets to source lines, used for
/// stack traces and the debugger.
#[derive(Clone, Default)]
pub struct LineTable {
	spans: Vec<LineSpan>,
}

impl LineTable {
	/// Appends `times` code bytes belonging to `source_line`, coalescing
	/// with the previous span when the line repeats.
	pub fn add_line(&mut self, times: u8, source_line: u32) {
		if let Some(last) = self.spans.last_mut() {
			if last.source_line == source_line {
				last.end += times as u32;
				return;
			}
		}
		let start = self.spans.last().map(|span| span.end).unwrap_or(0);
		self.spans.push(LineSpan {
			source_line,
			start,
			end: start + times as u32,
		});
	}

	pub fn source_line_for(&self, byte_offset: u32) -> Result<u32, FatalError> {
		self.spans
			.iter()
			.find(|span| span.start <= byte_offset && byte_offset < span.end)
			.map(|span| span.source_line)
			.ok_or_else(|| {
				FatalError::IllegalAccess(format!("no source line mapping is present for byte {byte_offset}"))
			})
	}

	pub fn is_empty(&self) -> bool {
		self.spans.is_empty()
	}
}

/// Hash-map key wrapper giving values the canonical match equality:
/// `compare == Equal`, hashed structurally by tag.
#[derive(Clone)]
pub struct MatchKey(pub ObjRef);

impl PartialEq for MatchKey {
	fn eq(&self, other: &Self) -> bool {
		self.0.compare(&other.0) == Ordering::Equal
	}
}

impl Eq for MatchKey {}

impl Hash for MatchKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.0.structural_hash(state);
	}
}

/// Pattern-match dispatch: value to target location, with a default.
/// Integer cases sit in a dedicated no-hash table so the common case is
/// a direct lookup.
#[derive(Clone)]
pub struct MatchTable {
	cases: FxHashMap<MatchKey, u32>,
	int_cases: IntMap<i64, u32>,
	default_location: u32,
}

impl MatchTable {
	pub fn new(entries: Vec<(ObjRef, u32)>, default_location: u32) -> Self {
		let mut cases = FxHashMap::default();
		let mut int_cases = IntMap::default();
		for (value, location) in entries {
			match value.as_int() {
				Some(int) => {
					int_cases.insert(int, location);
				}
				None => {
					cases.insert(MatchKey(value), location);
				}
			}
		}
		Self { cases, int_cases, default_location }
	}

	pub fn count(&self) -> usize {
		self.cases.len() + self.int_cases.len()
	}

	pub fn default_location(&self) -> u32 {
		self.default_location
	}

	/// The target for `value`, or the default location when no case
	/// matches.
	pub fn perform(&self, value: &ObjRef) -> u32 {
		if let Some(int) = value.as_int() {
			return self.int_cases.get(&int).copied().unwrap_or(self.default_location);
		}
		self.cases
			.get(&MatchKey(value.clone()))
			.copied()
			.unwrap_or(self.default_location)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runtime::memory::MemoryManager;
	use crate::runtime::obj::Payload;

	#[test]
	fn variable_get_set_round_trips() {
		let manager = MemoryManager::new();
		let mut table = VariableTable::new(2, &manager.null());
		table.set(0, manager.int(1)).unwrap();
		assert_eq!(table.get(0).unwrap().as_int(), Some(1));
		assert!(table.get(2).is_err());
		assert!(table.set(2, manager.null()).is_err());
	}

	#[test]
	fn ramp_up_shares_one_cell() {
		let manager = MemoryManager::new();
		let mut table = VariableTable::new(1, &manager.null());
		table.set(0, manager.int(5)).unwrap();

		let capture = table.ramp_up(0, &manager).unwrap();
		assert_eq!(capture.captured().unwrap().as_int(), Some(5));
		assert!(Arc::ptr_eq(&capture, &table.ramp_up(0, &manager).unwrap()));

		// Writes through the table are visible through the capture and
		// the other way around.
		table.set(0, manager.int(6)).unwrap();
		assert_eq!(capture.captured().unwrap().as_int(), Some(6));
		capture.set_captured(manager.int(7)).unwrap();
		assert_eq!(table.get(0).unwrap().as_int(), Some(7));
	}

	#[test]
	fn cloned_tables_share_captures_but_not_plain_cells() {
		let manager = MemoryManager::new();
		let mut table = VariableTable::new(2, &manager.null());
		table.set(0, manager.int(1)).unwrap();
		table.ramp_up(1, &manager).unwrap();
		table.set(1, manager.int(2)).unwrap();

		let mut clone = table.clone();
		clone.set(0, manager.int(10)).unwrap();
		assert_eq!(table.get(0).unwrap().as_int(), Some(1));

		clone.set(1, manager.int(20)).unwrap();
		assert_eq!(table.get(1).unwrap().as_int(), Some(20));
	}

	#[test]
	fn exception_table_matches_first_covering_entry() {
		let manager = MemoryManager::new();
		let ty_a = manager.alloc(Payload::Instance);
		let ty_b = manager.alloc(Payload::Instance);
		let mut table = ExceptionTable::default();
		table.add(ExceptionEntry::new(0, 5, 10, ty_a.clone(), Default::default()));
		table.add(ExceptionEntry::new(0, 8, 20, ty_b.clone(), Default::default()));

		let catches_b = |ty: &ObjRef| Arc::ptr_eq(ty, &ty_b);
		assert_eq!(table.target_for(2, catches_b), Some(20));
		assert_eq!(table.target_for(2, |ty| Arc::ptr_eq(ty, &ty_a)), Some(10));
		assert_eq!(table.target_for(8, catches_b), None);
		assert_eq!(table.target_for(3, |_| false), None);
	}

	#[test]
	fn line_table_coalesces_and_resolves() {
		let mut table = LineTable::default();
		table.add_line(3, 10);
		table.add_line(2, 10);
		table.add_line(4, 12);
		assert_eq!(table.source_line_for(0).unwrap(), 10);
		assert_eq!(table.source_line_for(4).unwrap(), 10);
		assert_eq!(table.source_line_for(5).unwrap(), 12);
		assert_eq!(table.source_line_for(8).unwrap(), 12);
		assert!(table.source_line_for(9).is_err());
	}

	#[test]
	fn match_table_dispatches_ints_strings_and_defaults() {
		let manager = MemoryManager::new();
		let table = MatchTable::new(
			vec![
				(manager.int(1), 100),
				(manager.int(2), 200),
				(manager.string("x"), 300),
			],
			999,
		);
		assert_eq!(table.perform(&manager.int(1)), 100);
		assert_eq!(table.perform(&manager.int(2)), 200);
		assert_eq!(table.perform(&manager.int(3)), 999);
		assert_eq!(table.perform(&manager.string("x")), 300);
		assert_eq!(table.perform(&manager.string("y")), 999);
		assert_eq!(table.perform(&manager.null()), 999);
	}

	#[test]
	fn match_table_compares_arrays_structurally() {
		let manager = MemoryManager::new();
		let case = manager.array_from(vec![manager.int(1), manager.string("a")]);
		let table = MatchTable::new(vec![(case, 50)], 0);
		let probe = manager.array_from(vec![manager.int(1), manager.string("a")]);
		assert_eq!(table.perform(&probe), 50);
	}
}
