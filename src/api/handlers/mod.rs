pub mod system;
pub mod wallets;

pub use system::*;
pub use wallets::*;
