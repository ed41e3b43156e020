pub mod esplora;
pub mod postgres;

pub use esplora::EsploraClient;
pub use postgres::PostgresStore;
