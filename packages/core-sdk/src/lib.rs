pub mod config;
pub mod error;
pub mod models;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod upstream;

#[cfg(test)]
pub(crate) mod mock;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config;
    pub use crate::error;
    pub use crate::models;
    pub use crate::registry;
    pub use crate::relay;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::upstream;
}
