pub mod app_config;
pub mod booking_repo;
pub mod cache;
pub mod database;
pub mod events;
pub mod redis_repo;
pub mod refund_repo;
pub mod session_repo;

pub use booking_repo::StoreBookingRepository;
pub use cache::ResilientCache;
pub use database::DbClient;
pub use events::EventProducer;
pub use redis_repo::RedisClient;
pub use refund_repo::StoreRefundRepository;
pub use session_repo::StoreSessionRepository;
