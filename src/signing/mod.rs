pub mod derivation;

pub use derivation::{DerivedKey, KeyDerivation, DERIVATION_BRANCH};
