//! Wallet ledger: index allocation and the balance state machine.

pub mod allocator;
pub mod wallet_ledger;

pub use allocator::IndexAllocator;
pub use wallet_ledger::{Ledger, Release, WithdrawReservation};
