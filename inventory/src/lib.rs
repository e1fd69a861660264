pub mod models;
pub mod repository;
pub mod scripts;
pub mod service;

pub use models::{ChangeKind, StockLogEntry, StockRecord};
pub use repository::StockRepository;
pub use service::{InventoryService, StockKeeper};
