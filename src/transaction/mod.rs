//! Outbound transaction construction: coin selection and P2WPKH signing.

pub mod builder;
pub mod selector;

pub use builder::{BuiltTransaction, TransactionBuilder};
pub use selector::{Selection, UtxoSelector};
