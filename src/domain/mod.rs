pub mod amount;
pub mod entry;
pub mod wallet;

pub use amount::*;
pub use entry::*;
pub use wallet::*;
