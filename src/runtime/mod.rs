pub mod object;
pub mod runtime_error;
pub mod table;
pub mod vm;

pub use object::{Handle, Heap, Obj};
pub use runtime_error::RuntimeError;
pub use table::Table;
pub use vm::{Vm, VmConfig};
