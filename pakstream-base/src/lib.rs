pub mod hashing;

mod name;
mod priority;
mod request_id;
mod symbol_index;

pub use name::PackageName;
pub use priority::LoadPriority;
pub use request_id::RequestId;
pub use symbol_index::SymbolIndex;
