//! The heap and object model, plus the activation-record machinery:
//! every runtime value, the manager that allocates them, per-object
//! recursive monitors, and the frame/table structures the interpreter
//! executes against.

pub mod frame;
pub mod memory;
pub mod monitor;
pub mod obj;
pub mod tables;

pub use frame::{Frame, FrameTemplate};
pub use memory::{CollectorHook, MemoryInfo, MemoryManager};
pub use monitor::Monitor;
pub use obj::{
	Flags, MemberSlot, MethodBody, MethodKind, MethodState, ModuleLoadState, ModuleState, Obj,
	ObjRef, ObjTag, Ordering, Payload, TypeKind, TypeState,
};
pub use tables::{ExceptionEntry, ExceptionTable, LineTable, MatchTable, VariableTable};
