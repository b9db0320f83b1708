pub mod value;

pub use value::{NativeFn, NativeFunction, Value};
