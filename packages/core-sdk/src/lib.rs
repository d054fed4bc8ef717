pub mod assistant;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod remote;
pub mod secrets;
pub mod server;
pub mod store;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::errors::ApiError;
    pub use crate::models;
    pub use crate::secrets::SecretResolver;
    pub use crate::server;
    pub use crate::store::{ContentStore, IdentityProvider};
    pub use crate::telemetry;
}
