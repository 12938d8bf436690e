pub mod file;
pub mod proxy;

pub use file::FileHandler;
pub use proxy::ProxyHandler;
