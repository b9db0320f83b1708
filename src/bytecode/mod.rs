pub mod chunk;
pub mod compile_error;
pub mod compiler;
pub mod disasm;
pub mod op;

pub use chunk::Chunk;
pub use compile_error::CompileError;
pub use compiler::compile;
pub use op::Op;
