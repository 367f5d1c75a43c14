pub mod group;
pub mod keys;
pub mod store;
pub mod toml;

/// Re-export often used types
pub use energon::drand::traits::DrandScheme as Scheme;
pub use energon::points::KeyPoint;
pub use energon::points::SigPoint;
